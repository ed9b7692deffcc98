#![forbid(unsafe_code)]
//! Bounded JSONL framing for child process output.
//!
//! A supervised child writes one JSON value per `\n`-terminated line on
//! stdout. [`StreamEngine`] frames that byte stream with a hard per-line
//! cap, decodes each line, and publishes [`StreamRecord`]s with gap-free,
//! strictly increasing sequence numbers into a **bounded** channel. When
//! the consumer stops draining, the engine stops reading, the OS pipe
//! fills, and the child's writes block: backpressure without dropping a
//! single record.
//!
//! Malformed or oversized lines become per-record `decode-error` meta
//! records; only read I/O errors are fatal to the stream. Stderr is drained
//! on a separate reader into a fixed-capacity ring buffer and surfaced when
//! the stream finishes. Exactly one terminal meta record closes every
//! stream.

mod engine;
mod reader;
mod record;
mod ring;

pub use engine::{EngineConfig, PumpOutcome, StreamEngine};
pub use reader::{BoundedLine, BoundedLineReader};
pub use record::{
    DecodeErrorReason, MetaRecord, RecordPayload, RecordSource, StreamCounters, StreamRecord,
    TerminalReason,
};
pub use ring::StderrRing;
