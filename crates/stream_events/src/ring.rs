use std::collections::VecDeque;

/// Fixed-capacity byte ring for captured stderr.
///
/// Keeps the most recent `capacity` bytes; older bytes fall off the front.
/// Stderr is free text and truncation may split a line; the consumer gets
/// a lossy tail.
#[derive(Debug)]
pub struct StderrRing {
    capacity: usize,
    buf: VecDeque<u8>,
    truncated: bool,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity.min(8192)),
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            self.truncated |= !bytes.is_empty();
            return;
        }
        if bytes.len() >= self.capacity {
            self.truncated |= !self.buf.is_empty() || bytes.len() > self.capacity;
            self.buf.clear();
            self.buf.extend(&bytes[bytes.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.truncated = true;
        }
        self.buf.extend(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether bytes were lost off the front.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// The captured tail as lossy UTF-8.
    pub fn into_string(self) -> String {
        let bytes: Vec<u8> = self.buf.into_iter().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
