use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE_BYTES: usize = 8192;

/// One framing outcome from [`BoundedLineReader`].
#[derive(Debug)]
pub enum BoundedLine {
    Line {
        line_number: usize,
        bytes: Vec<u8>,
    },
    /// The line exceeded the cap; its bytes were discarded but framing
    /// resynchronizes at the next newline.
    LineTooLong {
        line_number: usize,
        observed_bytes: usize,
        max_line_bytes: usize,
    },
    Io {
        line_number: usize,
        source: io::Error,
    },
}

/// Splits an async byte stream on `\n` with a hard per-line byte cap.
///
/// Oversized lines are dropped (not truncated): once a line crosses the
/// cap, its accumulated bytes are discarded and the remainder is skipped
/// until the newline, so memory stays bounded no matter what the child
/// writes. A final unterminated line is yielded at EOF.
pub struct BoundedLineReader<R> {
    reader: R,
    max_line_bytes: usize,
    buffer: [u8; CHUNK_SIZE_BYTES],
    buffer_pos: usize,
    buffer_len: usize,
    current_line: Vec<u8>,
    observed_bytes: usize,
    discard_mode: bool,
    line_number: usize,
    bytes_read: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> BoundedLineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            buffer: [0u8; CHUNK_SIZE_BYTES],
            buffer_pos: 0,
            buffer_len: 0,
            current_line: Vec::new(),
            observed_bytes: 0,
            discard_mode: false,
            line_number: 0,
            bytes_read: 0,
            done: false,
        }
    }

    /// Total bytes consumed from the underlying stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads the next framed line. `None` at EOF.
    pub async fn next_line(&mut self) -> Option<BoundedLine> {
        if self.done {
            return None;
        }

        loop {
            if self.buffer_pos >= self.buffer_len {
                self.buffer_pos = 0;
                match self.reader.read(&mut self.buffer).await {
                    Ok(0) => {
                        self.done = true;
                        if self.discard_mode || !self.current_line.is_empty() {
                            return Some(self.finish_line());
                        }
                        return None;
                    }
                    Ok(n) => {
                        self.buffer_len = n;
                        self.bytes_read += n as u64;
                    }
                    Err(source) => {
                        self.done = true;
                        let line_number = self.line_number + 1;
                        self.line_number = line_number;
                        return Some(BoundedLine::Io {
                            line_number,
                            source,
                        });
                    }
                }
            }

            let slice = &self.buffer[self.buffer_pos..self.buffer_len];
            let newline_idx = slice.iter().position(|b| *b == b'\n');
            let slice_len = slice.len();

            let Some(newline_idx) = newline_idx else {
                self.observe_bytes(slice_len);
                if !self.discard_mode {
                    let slice = &self.buffer[self.buffer_pos..self.buffer_len];
                    self.current_line.extend_from_slice(slice);
                }
                self.buffer_pos = self.buffer_len;
                continue;
            };

            self.observe_bytes(newline_idx);
            if !self.discard_mode {
                let segment = &self.buffer[self.buffer_pos..self.buffer_pos + newline_idx];
                self.current_line.extend_from_slice(segment);
            }
            self.buffer_pos = self.buffer_pos + newline_idx + 1;
            return Some(self.finish_line());
        }
    }

    fn observe_bytes(&mut self, additional: usize) {
        self.observed_bytes = self.observed_bytes.saturating_add(additional);
        if self.observed_bytes > self.max_line_bytes && !self.discard_mode {
            self.discard_mode = true;
            self.current_line.clear();
        }
    }

    fn finish_line(&mut self) -> BoundedLine {
        let line_number = self.line_number + 1;
        self.line_number = line_number;

        let result = if self.discard_mode {
            BoundedLine::LineTooLong {
                line_number,
                observed_bytes: self.observed_bytes,
                max_line_bytes: self.max_line_bytes,
            }
        } else {
            BoundedLine::Line {
                line_number,
                bytes: std::mem::take(&mut self.current_line),
            }
        };

        self.current_line.clear();
        self.observed_bytes = 0;
        self.discard_mode = false;
        result
    }
}
