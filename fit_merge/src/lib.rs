//! Merge supplementary physiological metrics from one FIT recording into the
//! timeline of another.
//!
//! The base recording supplies the route and every structural message; the source
//! recording supplies heart rate, power, cadence and ventilation metrics keyed by
//! timestamp. Metrics are joined on exact timestamp equality and zero-filled when
//! absent.

pub mod base;
pub mod decode;
pub mod encode;
pub mod fit;
pub mod merge;
pub mod output;
pub mod profile;
pub mod schema;
pub mod source;

use thiserror::Error;

pub use base::{walk_base, BaseMessage, BaseStream, TimelineRecord};
pub use merge::{
    MergeEngine, MergeOptions, MergeStats, PositionFixPolicy, RecordOutcome, RecordReport,
};
pub use output::{FileIdentity, FitFileSink, OutputEntry, OutputRecord, OutputSink};
pub use schema::{DeveloperFieldSchema, DeveloperMetric};
pub use source::{extract_source, DuplicatePolicy, SourceMap, SourceSample, SourceSlotMap};

/// Timestamp tick shared by both recordings (FIT seconds since 1989-12-31 UTC).
pub type Timestamp = u32;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("failed to decode FIT data: {0}")]
    Decode(String),
    #[error("FIT CRC mismatch: stored {expected:#06x}, computed {found:#06x}")]
    Crc { expected: u16, found: u16 },
    #[error("duplicate source timestamp {0}")]
    DuplicateTimestamp(Timestamp),
    #[error("invalid slot map: {0}")]
    InvalidSlotMap(String),
    #[error("invalid merge options: {0}")]
    InvalidOptions(String),
    #[error("metadata emitted after the first data record")]
    MetadataAfterData,
    #[error("failed to encode FIT data: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Merge `source` metrics into `base`, returning the encoded output file.
///
/// Both inputs are decoded in full before anything is encoded, so a malformed
/// input never produces partial output.
pub fn merge_fit(
    base: &[u8],
    source: &[u8],
    options: &MergeOptions,
) -> Result<(Vec<u8>, MergeStats)> {
    let source_map = extract_source(source, &options.slot_map, options.duplicates)?;
    let base_stream = walk_base(base)?;

    let mut sink = FitFileSink::new(Vec::new());
    let stats = MergeEngine::new(&source_map, options).run(&base_stream, &mut sink)?;
    let bytes = sink.finish()?;
    Ok((bytes, stats))
}
