use std::fmt;

/// Fixed-length character row. Every write clips to the row bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBuffer {
    chars: Vec<char>,
}

impl TextBuffer {
    pub fn filled(fill: char, len: usize) -> Self {
        Self {
            chars: vec![fill; len],
        }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Writes `text` so that its first character lands on column `start`.
    ///
    /// `start` may be negative, in which case the leading characters fall off
    /// the left edge.
    pub fn write_at(&mut self, text: &str, start: i64) {
        let len = self.chars.len() as i64;
        for (offset, ch) in text.chars().enumerate() {
            let column = start.saturating_add(offset as i64);
            if column >= len {
                break;
            }
            if column >= 0 {
                self.chars[column as usize] = ch;
            }
        }
    }

    pub fn fill(&mut self, fill: char) {
        self.chars.iter_mut().for_each(|slot| *slot = fill);
    }

    pub fn fill_range(&mut self, fill: char, start: i64, end: i64) {
        let len = self.chars.len() as i64;
        let start = start.clamp(0, len) as usize;
        let end = end.clamp(0, len) as usize;
        if start < end {
            self.chars[start..end]
                .iter_mut()
                .for_each(|slot| *slot = fill);
        }
    }

    pub fn char_at(&self, index: usize) -> Option<char> {
        self.chars.get(index).copied()
    }
}

impl fmt::Display for TextBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in &self.chars {
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_inside_bounds_is_exact() {
        let mut buffer = TextBuffer::filled(' ', 5);
        buffer.write_at("abc", 1);
        assert_eq!(buffer.to_string(), " abc ");
    }

    #[test]
    fn write_past_right_edge_clips() {
        let mut buffer = TextBuffer::filled('.', 4);
        buffer.write_at("hello", 2);
        assert_eq!(buffer.to_string(), "..he");
    }

    #[test]
    fn negative_start_drops_leading_characters() {
        let mut buffer = TextBuffer::filled('.', 4);
        buffer.write_at("hello", -3);
        assert_eq!(buffer.to_string(), "lo..");
    }

    #[test]
    fn far_out_of_range_writes_are_ignored() {
        let mut buffer = TextBuffer::filled('.', 3);
        buffer.write_at("abc", 100);
        buffer.write_at("abc", -100);
        buffer.write_at("abc", i64::MAX);
        buffer.write_at("abc", i64::MIN);
        assert_eq!(buffer.to_string(), "...");
    }

    #[test]
    fn fill_range_is_clamped() {
        let mut buffer = TextBuffer::filled('.', 5);
        buffer.fill_range('#', -2, 2);
        buffer.fill_range('#', 4, 99);
        assert_eq!(buffer.to_string(), "##..#");
    }
}
