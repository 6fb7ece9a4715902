mod display;
mod text_buffer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use display::DisplayBuffer;
pub use text_buffer::TextBuffer;

pub const PALETTE_SIZE: u8 = 16;
pub const DEFAULT_TEXT_COLOUR: u8 = 0;
pub const DEFAULT_BACKGROUND_COLOUR: u8 = 15;

const HEX_DIGITS: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

pub fn colour_to_hex(colour: u8) -> char {
    HEX_DIGITS[(colour % PALETTE_SIZE) as usize]
}

pub fn hex_to_colour(ch: char) -> Option<u8> {
    ch.to_digit(16).map(|digit| digit as u8)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlitError {
    #[error("arguments must be the same length")]
    LengthMismatch,
    #[error("invalid colour '{0}'")]
    InvalidColour(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub text_colour: u8,
    pub background_colour: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSnapshot {
    pub width: usize,
    pub height: usize,
    pub cursor_x: i64,
    pub cursor_y: i64,
    pub cursor_blink: bool,
    pub lines: Vec<String>,
    pub text_colours: Vec<String>,
    pub background_colours: Vec<String>,
}

/// Character grid with a cursor and a current pair of colours.
///
/// Colours are stored per row as hex digits, one per cell, so a row of text
/// and its two colour rows can be blitted in one call.
#[derive(Debug, Clone)]
pub struct Terminal {
    width: usize,
    height: usize,
    cursor_x: i64,
    cursor_y: i64,
    cursor_blink: bool,
    text_colour: u8,
    background_colour: u8,
    text: Vec<TextBuffer>,
    text_colours: Vec<TextBuffer>,
    background_colours: Vec<TextBuffer>,
}

impl Terminal {
    pub fn new(width: usize, height: usize) -> Self {
        let mut terminal = Self {
            width,
            height,
            cursor_x: 0,
            cursor_y: 0,
            cursor_blink: false,
            text_colour: DEFAULT_TEXT_COLOUR,
            background_colour: DEFAULT_BACKGROUND_COLOUR,
            text: Vec::new(),
            text_colours: Vec::new(),
            background_colours: Vec::new(),
        };
        terminal.rebuild_rows();
        terminal
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Reallocates the grid; previous contents are discarded.
    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.rebuild_rows();
    }

    pub fn clear(&mut self) {
        self.rebuild_rows();
    }

    pub fn clear_line(&mut self) {
        let Some(row) = self.row_index(self.cursor_y) else {
            return;
        };
        self.text[row].fill(' ');
        self.text_colours[row].fill(colour_to_hex(self.text_colour));
        self.background_colours[row].fill(colour_to_hex(self.background_colour));
    }

    /// Writes at the cursor using the current colours and advances the cursor.
    pub fn write(&mut self, text: &str) {
        let count = text.chars().count() as i64;
        if let Some(row) = self.row_index(self.cursor_y) {
            let start = self.cursor_x;
            let end = start.saturating_add(count);
            self.text[row].write_at(text, start);
            self.text_colours[row].fill_range(colour_to_hex(self.text_colour), start, end);
            self.background_colours[row].fill_range(
                colour_to_hex(self.background_colour),
                start,
                end,
            );
        }
        self.cursor_x = self.cursor_x.saturating_add(count);
    }

    /// Writes text with explicit per-cell colours given as hex digits.
    pub fn blit(
        &mut self,
        text: &str,
        text_colours: &str,
        backgrounds: &str,
    ) -> Result<(), BlitError> {
        let count = text.chars().count();
        if text_colours.chars().count() != count || backgrounds.chars().count() != count {
            return Err(BlitError::LengthMismatch);
        }
        if let Some(bad) = text_colours
            .chars()
            .chain(backgrounds.chars())
            .find(|ch| hex_to_colour(*ch).is_none())
        {
            return Err(BlitError::InvalidColour(bad));
        }

        if let Some(row) = self.row_index(self.cursor_y) {
            let start = self.cursor_x;
            self.text[row].write_at(text, start);
            self.text_colours[row].write_at(&text_colours.to_ascii_lowercase(), start);
            self.background_colours[row].write_at(&backgrounds.to_ascii_lowercase(), start);
        }
        self.cursor_x = self.cursor_x.saturating_add(count as i64);
        Ok(())
    }

    /// Moves content up by `lines` (down when negative), filling with blanks.
    pub fn scroll(&mut self, lines: i64) {
        if lines == 0 {
            return;
        }
        let height = self.height as i64;
        let blank_text = TextBuffer::filled(' ', self.width);
        let blank_fg = TextBuffer::filled(colour_to_hex(self.text_colour), self.width);
        let blank_bg = TextBuffer::filled(colour_to_hex(self.background_colour), self.width);

        let shift = |rows: &[TextBuffer], blank: &TextBuffer| -> Vec<TextBuffer> {
            (0..height)
                .map(|y| {
                    let source = y.saturating_add(lines);
                    if (0..height).contains(&source) {
                        rows[source as usize].clone()
                    } else {
                        blank.clone()
                    }
                })
                .collect()
        };

        self.text = shift(&self.text, &blank_text);
        self.text_colours = shift(&self.text_colours, &blank_fg);
        self.background_colours = shift(&self.background_colours, &blank_bg);
    }

    pub fn set_cursor(&mut self, x: i64, y: i64) {
        self.cursor_x = x;
        self.cursor_y = y;
    }

    pub fn cursor(&self) -> (i64, i64) {
        (self.cursor_x, self.cursor_y)
    }

    pub fn set_cursor_blink(&mut self, blink: bool) {
        self.cursor_blink = blink;
    }

    pub fn cursor_blink(&self) -> bool {
        self.cursor_blink
    }

    pub fn set_text_colour(&mut self, colour: u8) {
        self.text_colour = colour % PALETTE_SIZE;
    }

    pub fn text_colour(&self) -> u8 {
        self.text_colour
    }

    pub fn set_background_colour(&mut self, colour: u8) {
        self.background_colour = colour % PALETTE_SIZE;
    }

    pub fn background_colour(&self) -> u8 {
        self.background_colour
    }

    pub fn cell(&self, x: usize, y: usize) -> Option<Cell> {
        let ch = self.text.get(y)?.char_at(x)?;
        let fg = self.text_colours[y].char_at(x).and_then(hex_to_colour)?;
        let bg = self.background_colours[y].char_at(x).and_then(hex_to_colour)?;
        Some(Cell {
            ch,
            text_colour: fg,
            background_colour: bg,
        })
    }

    pub fn line(&self, y: usize) -> Option<String> {
        self.text.get(y).map(ToString::to_string)
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            width: self.width,
            height: self.height,
            cursor_x: self.cursor_x,
            cursor_y: self.cursor_y,
            cursor_blink: self.cursor_blink,
            lines: self.text.iter().map(ToString::to_string).collect(),
            text_colours: self.text_colours.iter().map(ToString::to_string).collect(),
            background_colours: self
                .background_colours
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    fn row_index(&self, y: i64) -> Option<usize> {
        (y >= 0 && (y as usize) < self.height).then_some(y as usize)
    }

    fn rebuild_rows(&mut self) {
        let fg = colour_to_hex(self.text_colour);
        let bg = colour_to_hex(self.background_colour);
        self.text = vec![TextBuffer::filled(' ', self.width); self.height];
        self.text_colours = vec![TextBuffer::filled(fg, self.width); self.height];
        self.background_colours = vec![TextBuffer::filled(bg, self.width); self.height];
    }
}
