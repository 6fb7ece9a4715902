use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::vfs::{FileSystem, FsError};

pub const MAX_SIZE: usize = 512 * 1024;
pub const MAX_PACKET_SIZE: usize = 30 * 1024;
pub const MAX_FILES: usize = 32;
pub const MAX_FILE_NAME: usize = 128;

pub const FLAG_FIRST: u8 = 1;
pub const FLAG_LAST: u8 = 2;

pub type Checksum = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("no files to upload")]
    Empty,
    #[error("too many files ({count})")]
    TooManyFiles { count: usize },
    #[error("file name '{name}' is too long")]
    NameTooLong { name: String },
    #[error("upload of {total} bytes is too large")]
    TooLarge { total: usize },
    #[error("first packet arrived while an upload was in progress")]
    UnexpectedFirst,
    #[error("packet arrived before the first packet")]
    MissingFirst,
    #[error("slice for file {file} at offset {offset} does not fit")]
    SliceOutOfRange { file: usize, offset: usize },
    #[error("checksum mismatch for '{name}'")]
    ChecksumMismatch { name: String },
    #[error("'{name}' already exists")]
    FileExists { name: String },
    #[error(transparent)]
    Fs(#[from] FsError),
}

pub fn sha256(bytes: &[u8]) -> Checksum {
    Sha256::digest(bytes).into()
}

pub fn to_hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

/// A file dropped onto a computer, with the checksum the sender computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    name: String,
    bytes: Vec<u8>,
    checksum: Checksum,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let checksum = sha256(&bytes);
        Self {
            name: name.into(),
            bytes,
            checksum,
        }
    }

    pub fn from_parts(name: impl Into<String>, bytes: Vec<u8>, checksum: Checksum) -> Self {
        Self {
            name: name.into(),
            bytes,
            checksum,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn checksum_hex(&self) -> String {
        to_hex_lower(&self.checksum)
    }

    pub fn is_valid(&self) -> bool {
        sha256(&self.bytes) == self.checksum
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHeader {
    pub name: String,
    pub size: usize,
    pub checksum: Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSlice {
    pub file: usize,
    pub offset: usize,
    pub bytes: Vec<u8>,
}

/// One network message. Only the first packet carries the file headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPacket {
    pub flag: u8,
    #[serde(default)]
    pub files: Vec<UploadHeader>,
    pub slices: Vec<FileSlice>,
}

impl UploadPacket {
    pub fn is_first(&self) -> bool {
        self.flag & FLAG_FIRST != 0
    }

    pub fn is_last(&self) -> bool {
        self.flag & FLAG_LAST != 0
    }

    pub fn payload_len(&self) -> usize {
        self.slices.iter().map(|slice| slice.bytes.len()).sum()
    }
}

fn validate_headers<'a>(
    headers: impl ExactSizeIterator<Item = (&'a str, usize)>,
) -> Result<(), UploadError> {
    let count = headers.len();
    if count == 0 {
        return Err(UploadError::Empty);
    }
    if count > MAX_FILES {
        return Err(UploadError::TooManyFiles { count });
    }
    let mut total = 0usize;
    for (name, size) in headers {
        if name.len() > MAX_FILE_NAME {
            return Err(UploadError::NameTooLong {
                name: name.to_string(),
            });
        }
        total = total.saturating_add(size);
    }
    if total > MAX_SIZE {
        return Err(UploadError::TooLarge { total });
    }
    Ok(())
}

/// Splits `uploads` into packets. Every packet but the last is filled to
/// capacity; the first leaves room for the file headers.
pub fn send_uploads(uploads: &[FileUpload]) -> Result<Vec<UploadPacket>, UploadError> {
    validate_headers(
        uploads
            .iter()
            .map(|upload| (upload.name.as_str(), upload.bytes.len())),
    )?;

    let mut packets = Vec::new();
    let mut current = UploadPacket {
        flag: FLAG_FIRST,
        files: uploads
            .iter()
            .map(|upload| UploadHeader {
                name: upload.name.clone(),
                size: upload.bytes.len(),
                checksum: upload.checksum,
            })
            .collect(),
        slices: Vec::new(),
    };
    let mut remaining = MAX_PACKET_SIZE - MAX_FILE_NAME * MAX_FILES;

    for (file, upload) in uploads.iter().enumerate() {
        let mut offset = 0;
        while offset < upload.bytes.len() {
            if remaining == 0 {
                let next = UploadPacket {
                    flag: 0,
                    files: Vec::new(),
                    slices: Vec::new(),
                };
                packets.push(std::mem::replace(&mut current, next));
                remaining = MAX_PACKET_SIZE;
            }
            let take = remaining.min(upload.bytes.len() - offset);
            current.slices.push(FileSlice {
                file,
                offset,
                bytes: upload.bytes[offset..offset + take].to_vec(),
            });
            offset += take;
            remaining -= take;
        }
    }

    current.flag |= FLAG_LAST;
    packets.push(current);
    Ok(packets)
}

/// Receiving end of [`send_uploads`]. Feed packets in order; the last one
/// yields the verified files.
#[derive(Debug, Default)]
pub struct UploadReassembler {
    files: Option<Vec<(UploadHeader, Vec<u8>)>>,
}

impl UploadReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.files.is_some()
    }

    pub fn accept(
        &mut self,
        packet: UploadPacket,
    ) -> Result<Option<Vec<FileUpload>>, UploadError> {
        let result = self.accept_inner(packet);
        if result.is_err() {
            self.files = None;
        }
        result
    }

    fn accept_inner(
        &mut self,
        packet: UploadPacket,
    ) -> Result<Option<Vec<FileUpload>>, UploadError> {
        if packet.is_first() {
            if self.files.is_some() {
                return Err(UploadError::UnexpectedFirst);
            }
            validate_headers(
                packet
                    .files
                    .iter()
                    .map(|header| (header.name.as_str(), header.size)),
            )?;
            self.files = Some(
                packet
                    .files
                    .iter()
                    .map(|header| (header.clone(), vec![0; header.size]))
                    .collect(),
            );
        }

        let is_last = packet.is_last();
        let files = self.files.as_mut().ok_or(UploadError::MissingFirst)?;
        for slice in packet.slices {
            let out_of_range = UploadError::SliceOutOfRange {
                file: slice.file,
                offset: slice.offset,
            };
            let (_, buffer) = files.get_mut(slice.file).ok_or(out_of_range.clone())?;
            let end = slice
                .offset
                .checked_add(slice.bytes.len())
                .filter(|end| *end <= buffer.len())
                .ok_or(out_of_range)?;
            buffer[slice.offset..end].copy_from_slice(&slice.bytes);
        }

        if !is_last {
            return Ok(None);
        }
        let files = self.files.take().unwrap_or_default();
        files
            .into_iter()
            .map(|(header, bytes)| {
                let upload = FileUpload::from_parts(header.name, bytes, header.checksum);
                if upload.is_valid() {
                    Ok(upload)
                } else {
                    Err(UploadError::ChecksumMismatch {
                        name: upload.name,
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// Writes every upload into `fs`. Nothing is written unless all checksums
/// match and no target exists yet. Returns the written names in order.
pub fn write_uploads(
    fs: &dyn FileSystem,
    uploads: &[FileUpload],
) -> Result<Vec<String>, UploadError> {
    if uploads.is_empty() {
        return Err(UploadError::Empty);
    }
    for upload in uploads {
        if !upload.is_valid() {
            return Err(UploadError::ChecksumMismatch {
                name: upload.name.clone(),
            });
        }
        if fs.exists(&upload.name) {
            return Err(UploadError::FileExists {
                name: upload.name.clone(),
            });
        }
    }
    for upload in uploads {
        fs.write(&upload.name, &upload.bytes)?;
    }
    Ok(uploads.iter().map(|upload| upload.name.clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFileSystem;

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn reassemble(packets: Vec<UploadPacket>) -> Result<Vec<FileUpload>, UploadError> {
        let mut receiver = UploadReassembler::new();
        let mut output = None;
        for packet in packets {
            output = receiver.accept(packet)?;
        }
        output.ok_or(UploadError::MissingFirst)
    }

    #[test]
    fn small_upload_fits_one_packet() {
        let uploads = vec![FileUpload::new("hello.lua", b"print('hi')".to_vec())];
        let packets = send_uploads(&uploads).expect("send");

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].flag, FLAG_FIRST | FLAG_LAST);
        assert_eq!(reassemble(packets).expect("receive"), uploads);
    }

    #[test]
    fn large_uploads_pack_non_final_packets_full() {
        let uploads = vec![
            FileUpload::new("a.bin", patterned(70_000, 1)),
            FileUpload::new("empty", Vec::new()),
            FileUpload::new("b.bin", patterned(100_000, 7)),
        ];
        let packets = send_uploads(&uploads).expect("send");

        assert!(packets.len() > 2);
        for (index, packet) in packets.iter().enumerate() {
            assert_eq!(packet.is_first(), index == 0);
            assert_eq!(packet.is_last(), index == packets.len() - 1);
            assert!(packet.payload_len() <= MAX_PACKET_SIZE);
            if !packet.is_last() {
                let expected = if packet.is_first() {
                    MAX_PACKET_SIZE - MAX_FILE_NAME * MAX_FILES
                } else {
                    MAX_PACKET_SIZE
                };
                assert_eq!(packet.payload_len(), expected);
            }
        }
        assert_eq!(reassemble(packets).expect("receive"), uploads);
    }

    #[test]
    fn corrupted_byte_is_rejected() {
        let uploads = vec![FileUpload::new("data", patterned(5_000, 3))];
        let mut packets = send_uploads(&uploads).expect("send");
        packets[0].slices[0].bytes[10] ^= 0xff;

        assert_eq!(
            reassemble(packets),
            Err(UploadError::ChecksumMismatch {
                name: "data".to_string()
            })
        );
    }

    #[test]
    fn limits_are_enforced_before_sending() {
        let too_many: Vec<FileUpload> = (0..=MAX_FILES)
            .map(|i| FileUpload::new(format!("f{i}"), vec![]))
            .collect();
        assert_eq!(
            send_uploads(&too_many),
            Err(UploadError::TooManyFiles {
                count: MAX_FILES + 1
            })
        );

        let long_name = "x".repeat(MAX_FILE_NAME + 1);
        assert!(matches!(
            send_uploads(&[FileUpload::new(long_name, vec![])]),
            Err(UploadError::NameTooLong { .. })
        ));

        assert_eq!(
            send_uploads(&[FileUpload::new("big", vec![0; MAX_SIZE + 1])]),
            Err(UploadError::TooLarge { total: MAX_SIZE + 1 })
        );
        assert_eq!(send_uploads(&[]), Err(UploadError::Empty));
    }

    #[test]
    fn out_of_order_packets_are_rejected() {
        let uploads = vec![FileUpload::new("a", patterned(40_000, 5))];
        let packets = send_uploads(&uploads).expect("send");
        let mut receiver = UploadReassembler::new();

        assert_eq!(
            receiver.accept(packets[1].clone()),
            Err(UploadError::MissingFirst)
        );
        assert_eq!(receiver.accept(packets[0].clone()), Ok(None));
        assert_eq!(
            receiver.accept(packets[0].clone()),
            Err(UploadError::UnexpectedFirst)
        );
        assert!(!receiver.in_progress());
    }

    #[test]
    fn slice_outside_declared_size_is_rejected() {
        let uploads = vec![FileUpload::new("a", vec![1, 2, 3])];
        let mut packets = send_uploads(&uploads).expect("send");
        packets[0].slices[0].offset = 2;

        assert_eq!(
            reassemble(packets),
            Err(UploadError::SliceOutOfRange { file: 0, offset: 2 })
        );
    }

    #[test]
    fn write_uploads_refuses_to_overwrite() {
        let fs = MemoryFileSystem::new();
        fs.write("taken", b"old").expect("write");
        let uploads = vec![
            FileUpload::new("fresh", b"new".to_vec()),
            FileUpload::new("taken", b"new".to_vec()),
        ];

        assert_eq!(
            write_uploads(&fs, &uploads),
            Err(UploadError::FileExists {
                name: "taken".to_string()
            })
        );
        assert!(!fs.exists("fresh"));

        let written = write_uploads(&fs, &uploads[..1]).expect("write");
        assert_eq!(written, vec!["fresh"]);
        assert_eq!(fs.read("fresh").expect("read"), b"new");
    }

    #[test]
    fn checksum_hex_is_lowercase_sha256() {
        let upload = FileUpload::new("abc", b"abc".to_vec());
        assert_eq!(
            upload.checksum_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
