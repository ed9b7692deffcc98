use std::sync::Arc;

use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    reader::{BoundedLine, BoundedLineReader},
    record::{DecodeErrorReason, MetaRecord, RecordPayload, StreamCounters, StreamRecord, TerminalReason},
    ring::StderrRing,
};

/// Framing and capture limits for one stream.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Hard cap on a single stdout line.
    pub max_line_bytes: usize,
    /// Capacity of the stderr ring buffer.
    pub stderr_ring_bytes: usize,
    /// How much of an undecodable line is carried in its error record.
    pub error_prefix_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 1024 * 1024,
            stderr_ring_bytes: 64 * 1024,
            error_prefix_bytes: 256,
        }
    }
}

/// How a pump run ended.
#[derive(Debug)]
pub enum PumpOutcome {
    /// stdout reached EOF; the child has (or is about to have) exited.
    Eof,
    Cancelled,
    /// Fatal read error on stdout. The supervisor treats this as abnormal
    /// termination.
    ReadFailed(std::io::Error),
}

/// Frames a child's stdout into [`StreamRecord`]s with backpressure.
///
/// The engine owns the producing half of the session's bounded record
/// channel and the sequence counter; nothing else may publish records for
/// the session. When the channel is full, [`StreamEngine::pump`] stops
/// reading from the child, which eventually blocks the child on its own
/// stdout pipe. Records are never discarded to make room.
pub struct StreamEngine {
    config: EngineConfig,
    tx: mpsc::Sender<StreamRecord>,
    counters: Arc<StreamCounters>,
    seq: u64,
}

impl StreamEngine {
    pub fn new(
        config: EngineConfig,
        tx: mpsc::Sender<StreamRecord>,
        counters: Arc<StreamCounters>,
    ) -> Self {
        Self {
            config,
            tx,
            counters,
            seq: 0,
        }
    }

    /// Pumps stdout and stderr until EOF, cancellation, or a fatal read
    /// error. Decode failures are per-record and do not end the pump.
    pub async fn pump<O, E>(
        &mut self,
        stdout: O,
        stderr: E,
        cancel: &CancellationToken,
    ) -> PumpOutcome
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let stderr_cancel = cancel.child_token();
        let stderr_task =
            spawn_stderr_reader(stderr, self.config.stderr_ring_bytes, stderr_cancel.clone());
        let mut reader = BoundedLineReader::new(stdout, self.config.max_line_bytes);
        let mut accounted_bytes = 0u64;

        let outcome = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break PumpOutcome::Cancelled,
                next = reader.next_line() => next,
            };

            let total = reader.bytes_read();
            self.counters.note_output_bytes(total - accounted_bytes);
            accounted_bytes = total;

            let Some(line) = next else {
                break PumpOutcome::Eof;
            };

            let payload = match line {
                BoundedLine::Line { bytes, .. } => self.decode_line(bytes),
                BoundedLine::LineTooLong {
                    line_number,
                    observed_bytes,
                    max_line_bytes,
                } => {
                    debug!(line_number, observed_bytes, max_line_bytes, "line over cap dropped");
                    RecordPayload::Meta(MetaRecord::DecodeError {
                        reason: DecodeErrorReason::LineTooLong,
                        prefix: String::new(),
                    })
                }
                BoundedLine::Io { source, .. } => {
                    warn!(%source, "fatal read error on child stdout");
                    break PumpOutcome::ReadFailed(source);
                }
            };

            if !self.send(payload, cancel).await {
                break PumpOutcome::Cancelled;
            }
        };

        // A fatal stdout error does not imply stderr will reach EOF; stop
        // its reader rather than wait on a live pipe.
        if matches!(outcome, PumpOutcome::ReadFailed(_)) {
            stderr_cancel.cancel();
        }
        let ring = match stderr_task.await {
            Ok(ring) => ring,
            Err(err) => {
                warn!(%err, "stderr reader task failed");
                StderrRing::new(0)
            }
        };
        if !ring.is_empty() {
            let text = ring.into_string();
            self.send(RecordPayload::Stderr(text), cancel).await;
        }

        outcome
    }

    /// Emits the single terminal meta record and closes the stream.
    pub async fn finish(self, reason: TerminalReason) {
        let record = StreamRecord {
            seq: self.seq + 1,
            payload: RecordPayload::Meta(MetaRecord::Terminal(reason)),
        };
        if self.tx.send(record).await.is_ok() {
            self.counters.note_record();
        }
        debug!(%reason, last_seq = self.seq + 1, "stream finished");
    }

    /// Every framed line yields exactly one payload. Blank lines are not
    /// valid JSON and decode like any other malformed line.
    fn decode_line(&self, bytes: Vec<u8>) -> RecordPayload {
        let line = match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(err) => {
                let lossy = String::from_utf8_lossy(err.as_bytes()).into_owned();
                return RecordPayload::Meta(MetaRecord::DecodeError {
                    reason: DecodeErrorReason::InvalidUtf8,
                    prefix: truncate_prefix(&lossy, self.config.error_prefix_bytes),
                });
            }
        };
        match serde_json::from_str::<Value>(&line) {
            Ok(value) => RecordPayload::Stdout(value),
            Err(err) => {
                debug!(%err, "stdout line is not valid JSON");
                RecordPayload::Meta(MetaRecord::DecodeError {
                    reason: DecodeErrorReason::InvalidJson,
                    prefix: truncate_prefix(&line, self.config.error_prefix_bytes),
                })
            }
        }
    }

    /// Sends one record, suspending while the channel is full. Returns
    /// `false` when cancelled or when the consumer is gone.
    async fn send(&mut self, payload: RecordPayload, cancel: &CancellationToken) -> bool {
        let record = StreamRecord {
            seq: self.seq + 1,
            payload,
        };
        tokio::select! {
            // Poll the send first so a ready channel still flushes the
            // record at the instant of cancellation.
            biased;
            sent = self.tx.send(record) => match sent {
                Ok(()) => {
                    self.seq += 1;
                    self.counters.note_record();
                    true
                }
                Err(_) => {
                    self.counters.records_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!("record channel closed before stream finished");
                    false
                }
            },
            _ = cancel.cancelled() => false,
        }
    }
}

fn spawn_stderr_reader<E>(
    stderr: E,
    capacity: usize,
    cancel: CancellationToken,
) -> JoinHandle<StderrRing>
where
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut ring = StderrRing::new(capacity);
        let mut chunk = [0u8; 4096];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = stderr.read(&mut chunk) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => ring.push(&chunk[..n]),
                Err(err) => {
                    debug!(%err, "stderr read ended");
                    break;
                }
            }
        }
        ring
    })
}

fn truncate_prefix(line: &str, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_truncation_respects_char_boundaries() {
        let line = "héllo wörld";
        let prefix = truncate_prefix(line, 2);
        assert!(prefix.len() <= 2);
        assert!(line.starts_with(&prefix));
    }
}
