use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::dirty::ChangeListener;
use crate::sync::lock_or_recover;

use super::{BlitError, Terminal, TerminalSnapshot};

/// Terminal shared between the worker that writes it and the renderer that
/// reads it.
///
/// Every mutation sets `changed`; only the false-to-true transition invokes
/// the change listener, so any number of writes between two
/// [`DisplayBuffer::poll_changed`] calls produce one notification.
pub struct DisplayBuffer {
    terminal: Mutex<Terminal>,
    pending_resize: Mutex<Option<(usize, usize)>>,
    changed: AtomicBool,
    resized: AtomicBool,
    listener: Option<ChangeListener>,
}

impl fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("changed", &self.changed.load(Ordering::Relaxed))
            .field("resized", &self.resized.load(Ordering::Relaxed))
            .field("has_listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

impl DisplayBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            terminal: Mutex::new(Terminal::new(width, height)),
            pending_resize: Mutex::new(None),
            changed: AtomicBool::new(false),
            resized: AtomicBool::new(false),
            listener: None,
        }
    }

    pub fn with_listener(width: usize, height: usize, listener: ChangeListener) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new(width, height)
        }
    }

    pub fn size(&self) -> (usize, usize) {
        let terminal = self.lock();
        (terminal.width(), terminal.height())
    }

    /// Runs `f` against the terminal and marks the buffer changed.
    pub fn update<R>(&self, f: impl FnOnce(&mut Terminal) -> R) -> R {
        let result = {
            let mut terminal = self.lock();
            f(&mut terminal)
        };
        self.mark_changed();
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&Terminal) -> R) -> R {
        f(&self.lock())
    }

    pub fn write(&self, text: &str) {
        self.update(|terminal| terminal.write(text));
    }

    pub fn blit(&self, text: &str, text_colours: &str, backgrounds: &str) -> Result<(), BlitError> {
        self.update(|terminal| terminal.blit(text, text_colours, backgrounds))
    }

    pub fn clear(&self) {
        self.update(Terminal::clear);
    }

    pub fn clear_line(&self) {
        self.update(Terminal::clear_line);
    }

    pub fn scroll(&self, lines: i64) {
        self.update(|terminal| terminal.scroll(lines));
    }

    pub fn set_cursor(&self, x: i64, y: i64) {
        self.update(|terminal| terminal.set_cursor(x, y));
    }

    pub fn set_text_colour(&self, colour: u8) {
        self.update(|terminal| terminal.set_text_colour(colour));
    }

    pub fn set_background_colour(&self, colour: u8) {
        self.update(|terminal| terminal.set_background_colour(colour));
    }

    /// Reallocates the grid in place, discarding contents.
    pub fn resize(&self, width: usize, height: usize) {
        self.lock().resize(width, height);
        self.resized.store(true, Ordering::Release);
        self.mark_changed();
    }

    /// Records a resize that [`DisplayBuffer::apply_pending_resize`] performs
    /// later on the owner's turn. A newer request replaces an older one.
    pub fn request_resize(&self, width: usize, height: usize) {
        *lock_or_recover(&self.pending_resize, "display_pending_resize") = Some((width, height));
    }

    pub fn apply_pending_resize(&self) -> bool {
        let pending = lock_or_recover(&self.pending_resize, "display_pending_resize").take();
        match pending {
            Some((width, height)) => {
                self.resize(width, height);
                true
            }
            None => false,
        }
    }

    pub fn poll_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    pub fn poll_resized(&self) -> bool {
        self.resized.swap(false, Ordering::AcqRel)
    }

    pub fn mark_changed(&self) {
        if !self.changed.swap(true, Ordering::AcqRel) {
            if let Some(listener) = &self.listener {
                listener();
            }
        }
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        self.lock().snapshot()
    }

    pub fn line(&self, y: usize) -> Option<String> {
        self.lock().line(y)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Terminal> {
        lock_or_recover(&self.terminal, "display_terminal")
    }
}
