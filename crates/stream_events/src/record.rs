use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Value};

/// One element of a session's output stream.
///
/// Sequence numbers are per-session, 1-based, strictly increasing and
/// gap-free; [`crate::StreamEngine`] is the only producer.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRecord {
    pub seq: u64,
    pub payload: RecordPayload,
}

impl StreamRecord {
    /// The JSON body published to the MCP peer.
    pub fn to_wire(&self) -> Value {
        match &self.payload {
            RecordPayload::Stdout(value) => json!({
                "seq": self.seq,
                "source": "stdout",
                "value": value,
            }),
            RecordPayload::Stderr(text) => json!({
                "seq": self.seq,
                "source": "stderr",
                "text": text,
            }),
            RecordPayload::Meta(MetaRecord::DecodeError { reason, prefix }) => json!({
                "seq": self.seq,
                "source": "meta",
                "kind": "decode-error",
                "reason": reason.to_string(),
                "prefix": prefix,
            }),
            RecordPayload::Meta(MetaRecord::Terminal(reason)) => json!({
                "seq": self.seq,
                "source": "meta",
                "kind": "terminal",
                "reason": reason.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            RecordPayload::Meta(MetaRecord::Terminal(_))
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordPayload {
    /// A decoded JSON value from one stdout line, forwarded verbatim.
    Stdout(Value),
    /// Captured stderr text (ring buffer contents).
    Stderr(String),
    Meta(MetaRecord),
}

impl RecordPayload {
    pub fn source(&self) -> RecordSource {
        match self {
            RecordPayload::Stdout(_) => RecordSource::Stdout,
            RecordPayload::Stderr(_) => RecordSource::Stderr,
            RecordPayload::Meta(_) => RecordSource::Meta,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordSource {
    Stdout,
    Stderr,
    Meta,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MetaRecord {
    /// One line failed to decode; the stream continues.
    DecodeError {
        reason: DecodeErrorReason,
        /// Offending line truncated to a safe prefix.
        prefix: String,
    },
    /// The single final record of a stream.
    Terminal(TerminalReason),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeErrorReason {
    InvalidJson,
    InvalidUtf8,
    LineTooLong,
}

impl fmt::Display for DecodeErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeErrorReason::InvalidJson => "invalid-json",
            DecodeErrorReason::InvalidUtf8 => "invalid-utf8",
            DecodeErrorReason::LineTooLong => "line-too-long",
        };
        f.write_str(name)
    }
}

/// Why a stream ended. Rendered into the terminal meta record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminalReason {
    /// Output ended without a known exit status.
    Eof,
    /// The stream reader hit a fatal I/O error.
    StreamFailed,
    Cancelled,
    TimedOut,
    ChildExited(i32),
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::Eof => f.write_str("eof"),
            TerminalReason::StreamFailed => f.write_str("decode-error"),
            TerminalReason::Cancelled => f.write_str("cancelled"),
            TerminalReason::TimedOut => f.write_str("timed-out"),
            TerminalReason::ChildExited(code) => write!(f, "child-exited-with-code:{code}"),
        }
    }
}

/// Shared per-session stream counters.
///
/// The engine is the writer; the supervisor reads them for idle-timeout
/// checks and session listings. `records_dropped` exists to make the
/// no-loss invariant observable: it stays zero under correct backpressure.
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub input_bytes: AtomicU64,
    pub output_bytes: AtomicU64,
    pub records_emitted: AtomicU64,
    pub records_dropped: AtomicU64,
    /// Milliseconds since the epoch of the most recent record; 0 before the
    /// first record.
    pub last_record_unix_ms: AtomicU64,
}

impl StreamCounters {
    pub fn note_record(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
        self.last_record_unix_ms
            .store(unix_millis_now(), Ordering::Relaxed);
    }

    pub fn note_output_bytes(&self, bytes: u64) {
        self.output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn note_input_bytes(&self, bytes: u64) {
        self.input_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
