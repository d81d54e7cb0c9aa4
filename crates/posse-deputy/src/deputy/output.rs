//! Coalescing buffer for captured command output.
//!
//! Console chunks are appended per command and shipped in one
//! `PM_OUTPUT` message when the aggregate grows past a size threshold
//! or enough time has passed since the last publish. This keeps a
//! chatty command from turning every 1 KiB read into a datagram.

use posse_common::{CommandId, CommandOutput};

pub const FLUSH_THRESHOLD_BYTES: usize = 4096;
pub const FLUSH_INTERVAL_MS: i64 = 10;

#[derive(Debug, Default)]
pub struct OutputAccumulator {
    streams: Vec<CommandOutput>,
    total_bytes: usize,
    last_transmit_utime: i64,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to the command's pending text.
    pub fn append(&mut self, command_id: &CommandId, text: &str) {
        self.total_bytes += text.len();
        if let Some(entry) = self
            .streams
            .iter_mut()
            .find(|s| &s.command_id == command_id)
        {
            entry.text.push_str(text);
            return;
        }
        self.streams.push(CommandOutput {
            command_id: command_id.clone(),
            text: text.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    /// True once the buffer should be published: over the size
    /// threshold, or interval elapsed with anything buffered.
    pub fn flush_due(&self, now: i64) -> bool {
        if self.is_empty() {
            return false;
        }
        let ms_since_transmit = (now - self.last_transmit_utime).abs() / 1000;
        self.total_bytes > FLUSH_THRESHOLD_BYTES || ms_since_transmit >= FLUSH_INTERVAL_MS
    }

    /// Hand over the buffered streams and reset for the next window.
    pub fn take(&mut self, now: i64) -> Vec<CommandOutput> {
        self.total_bytes = 0;
        self.last_transmit_utime = now;
        std::mem::take(&mut self.streams)
    }
}
