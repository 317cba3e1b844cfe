//! Newline framing for helper stdout with a per-line size cap.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::warn;

use crate::launcher::OutputStream;

/// Longest status line kept. Longer lines are dropped whole.
pub const MAX_STATUS_LINE: usize = 64 * 1024;

/// Splits a stream into lines without ever buffering more than `max_len`
/// bytes of one line.
///
/// [`next_line`](Self::next_line) is cancel safe: a partial line survives in
/// the reader and the next call picks it up.
pub struct LineReader {
    inner: BufReader<OutputStream>,
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
    test_id: String,
}

impl LineReader {
    pub fn new(stream: OutputStream, max_len: usize, test_id: impl Into<String>) -> Self {
        Self {
            inner: BufReader::new(stream),
            buf: Vec::new(),
            max_len: max_len.max(1),
            overflowed: false,
            test_id: test_id.into(),
        }
    }

    /// Next line without its terminator, or `None` at end of stream. A final
    /// line lacking `\n` is still returned.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let room = self.max_len.saturating_sub(self.buf.len()).max(1) as u64;
            let n = (&mut self.inner)
                .take(room)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if n == 0 {
                if self.buf.is_empty() || std::mem::take(&mut self.overflowed) {
                    self.buf.clear();
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            if self.buf.ends_with(b"\n") {
                let line = self.take_line();
                if std::mem::take(&mut self.overflowed) {
                    continue;
                }
                return Ok(Some(line));
            }

            if self.buf.len() >= self.max_len {
                if !self.overflowed {
                    warn!(
                        test_id = %self.test_id,
                        max_len = self.max_len,
                        "helper output line too long, discarding it"
                    );
                }
                self.buf.clear();
                self.overflowed = true;
            }
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        self.buf.clear();
        line
    }
}
