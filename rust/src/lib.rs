//! numseq: human-readable sequential identifiers from declarative patterns.
//!
//! Invoice, customer and document numbers are described by a pattern of
//! literal text and bracketed tokens. Each (key, segment) pair owns a
//! persisted counter that can start over at year, month, week, day or hour
//! boundaries.
//!
//! # Pattern tokens
//!
//! ```text
//! {#}  {#|6}  {#|6|y}        counter, zero-padded, reset period y|m|w|d|h
//! {Y} {y} {m} {M} {d} {D} {H} current date parts (UTC)
//! {w} {W}                    current ISO-8601 week
//! ```
//!
//! Unknown tokens are kept verbatim.
//!
//! # Example
//!
//! ```
//! use numseq::{FieldMap, MemoryCounterStore, NumberGenerator, SequenceConfig};
//!
//! let generator = NumberGenerator::default();
//! let store = MemoryCounterStore::new();
//! let config = SequenceConfig::new("customer").with_pattern("KD-{#|6}");
//!
//! let number = generator.generate(&config, &FieldMap::new(), &store).expect("valid config");
//! assert_eq!(number, "KD-000001");
//! ```

mod clock;
mod config;
mod engine;
mod error;
mod handler;
mod segment;
mod store;
mod token;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{DEFAULT_PATTERN, SegmentOverride, SequenceConfig, SequenceField, Sequenced};
pub use engine::{Assignment, GenerationBatch, NumberGenerator};
pub use error::SequenceError;
pub use handler::{
    CounterHandler, DateHandler, MAX_PAD_WIDTH, ResetPeriod, TokenHandler, TokenHandlerRegistry, WeekHandler,
};
pub use segment::{FieldAccess, FieldMap, resolve_override, resolve_segment_value};
pub use store::{
    CounterKey, CounterRecord, CounterStore, FileCounterStore, MemoryCounterStore,
    STORE_FILE_VERSION,
};
pub use token::{Token, tokenize};
