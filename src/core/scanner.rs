use super::bus::KeyInput;

/// Turns keyboard-wedge key events into complete scanned codes.
///
/// The scanner types the code character by character and terminates it
/// with Enter.
#[derive(Debug, Default)]
pub struct ScannerInput {
    buffer: String,
}

impl ScannerInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one key; returns the finished code when Enter completes it.
    pub fn handle_key(&mut self, key: KeyInput) -> Option<String> {
        match key {
            KeyInput::Enter => Some(std::mem::take(&mut self.buffer)),
            KeyInput::Char(ch) if !ch.is_control() => {
                self.buffer.push(ch);
                None
            }
            KeyInput::Char(_) => None,
        }
    }

    /// Drop any partially typed code.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}
