//! Merge-and-rebuild engine.
//!
//! Joins base timeline records to source samples on exact timestamp equality.
//! Unmatched records and fields absent from a matched sample are zero-filled,
//! so a zero in the output cannot be told apart from a genuine zero reading.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::base::{BaseMessage, BaseStream, TimelineRecord};
use crate::fit::fit_time_to_utc;
use crate::output::{FileIdentity, OutputEntry, OutputRecord, OutputSink, VentilationMetrics};
use crate::schema::DeveloperFieldSchema;
use crate::source::{DuplicatePolicy, SourceMap, SourceSlotMap};
use crate::{MergeError, Result, Timestamp};

/// Handling of base timeline records that carry no heart rate (pure position fixes).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionFixPolicy {
    Drop,
    PassThrough,
}

impl Default for PositionFixPolicy {
    fn default() -> Self {
        PositionFixPolicy::Drop
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeOptions {
    pub slot_map: SourceSlotMap,
    pub duplicates: DuplicatePolicy,
    pub position_fixes: PositionFixPolicy,
    pub file_identity: FileIdentity,
}

impl MergeOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        let options: MergeOptions =
            serde_json::from_str(text).map_err(|e| MergeError::InvalidOptions(e.to_string()))?;
        options.slot_map.validate()?;
        Ok(options)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Matched,
    ZeroFilled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordReport {
    pub timestamp: Option<Timestamp>,
    pub outcome: RecordOutcome,
    pub heart_rate: u8,
    pub power: u16,
    pub cadence: u8,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeStats {
    /// Base timeline records with a heart-rate field.
    pub eligible: usize,
    pub matched: usize,
    pub zero_filled: usize,
    pub passed_through: usize,
    pub position_fixes_dropped: usize,
    pub position_fixes_kept: usize,
    pub records: Vec<RecordReport>,
}

impl MergeStats {
    fn record(&mut self, output: &OutputRecord) {
        self.eligible += 1;
        let outcome = if output.matched {
            self.matched += 1;
            RecordOutcome::Matched
        } else {
            self.zero_filled += 1;
            RecordOutcome::ZeroFilled
        };
        self.records.push(RecordReport {
            timestamp: output.timestamp,
            outcome,
            heart_rate: output.heart_rate,
            power: output.power,
            cadence: output.cadence,
        });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EngineState {
    EmittingMetadata,
    EmittingData,
}

pub struct MergeEngine<'a> {
    source: &'a SourceMap,
    options: &'a MergeOptions,
    state: EngineState,
}

impl<'a> MergeEngine<'a> {
    pub fn new(source: &'a SourceMap, options: &'a MergeOptions) -> Self {
        Self {
            source,
            options,
            state: EngineState::EmittingMetadata,
        }
    }

    /// Emit the metadata entries and then one entry per base message, in base order.
    pub fn run<S: OutputSink>(&mut self, base: &BaseStream, sink: &mut S) -> Result<MergeStats> {
        self.emit_metadata(base, sink)?;

        let mut stats = MergeStats::default();
        for message in base.messages() {
            match message {
                BaseMessage::Structural(message) => {
                    sink.emit(OutputEntry::PassThrough(message.clone()))?;
                    stats.passed_through += 1;
                }
                BaseMessage::Timeline(record) if record.heart_rate().is_none() => {
                    match self.options.position_fixes {
                        PositionFixPolicy::Drop => {
                            debug!("Dropping position fix at {:?}", record.timestamp());
                            stats.position_fixes_dropped += 1;
                        }
                        PositionFixPolicy::PassThrough => {
                            sink.emit(OutputEntry::PassThrough(record.message().clone()))?;
                            stats.position_fixes_kept += 1;
                        }
                    }
                }
                BaseMessage::Timeline(record) => {
                    let output = self.build_record(record);
                    stats.record(&output);
                    sink.emit(OutputEntry::Merged(output))?;
                }
            }
        }

        info!(
            "Merged {} records ({} matched, {} zero-filled), {} passed through, {} position fixes dropped",
            stats.eligible,
            stats.matched,
            stats.zero_filled,
            stats.passed_through,
            stats.position_fixes_dropped
        );
        Ok(stats)
    }

    fn emit_metadata<S: OutputSink>(&mut self, base: &BaseStream, sink: &mut S) -> Result<()> {
        if self.state != EngineState::EmittingMetadata {
            return Err(MergeError::MetadataAfterData);
        }
        let identity = FileIdentity {
            time_created: self
                .options
                .file_identity
                .time_created
                .or_else(|| base.first_timestamp()),
            ..self.options.file_identity.clone()
        };
        if let Some(created) = identity.time_created.and_then(fit_time_to_utc) {
            debug!("Merged file created at {}", created.to_rfc3339());
        }
        let index = base.free_developer_data_index().ok_or_else(|| {
            MergeError::Encode("base file uses every developer data index".into())
        })?;

        sink.emit(OutputEntry::FileId(identity))?;
        sink.emit(OutputEntry::DeveloperSchema(DeveloperFieldSchema::ventilation(
            index,
        )))?;
        self.state = EngineState::EmittingData;
        Ok(())
    }

    /// Build the merged record for a base timeline record that has a heart rate.
    pub fn build_record(&self, record: &TimelineRecord) -> OutputRecord {
        let sample = record.timestamp().and_then(|ts| self.source.get(ts));
        let base = record.message().clone();
        match sample {
            Some(sample) => OutputRecord {
                timestamp: record.timestamp(),
                heart_rate: sample.heart_rate.unwrap_or(0),
                power: sample.power.unwrap_or(0),
                cadence: sample.cadence.unwrap_or(0),
                metrics: VentilationMetrics {
                    breath_rate: sample.breath_rate.unwrap_or(0.0),
                    tidal_volume: sample.tidal_volume.unwrap_or(0.0),
                    minute_volume: sample.minute_volume.unwrap_or(0.0),
                    ve_zone: sample.ve_zone.unwrap_or(0.0),
                },
                matched: true,
                base,
            },
            None => OutputRecord {
                timestamp: record.timestamp(),
                heart_rate: 0,
                power: 0,
                cadence: 0,
                metrics: VentilationMetrics::default(),
                matched: false,
                base,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::{FitMessage, RawField, TIMESTAMP_FIELD};
    use crate::output::FitFileSink;
    use crate::profile::{MesgNum, RecordField};
    use crate::source::SourceSample;

    fn timeline(ts: u32, hr: Option<u8>) -> FitMessage {
        let mut message = FitMessage::new(MesgNum::Record)
            .with_field(RawField::uint32(TIMESTAMP_FIELD, ts))
            .with_field(RawField::uint32(RecordField::Distance.number(), ts * 10));
        if let Some(hr) = hr {
            message
                .fields
                .push(RawField::uint8(RecordField::HeartRate.number(), hr));
        }
        message
    }

    fn scenario_a_source() -> SourceMap {
        let mut source = SourceMap::new();
        source
            .insert(
                101,
                SourceSample {
                    heart_rate: Some(140),
                    power: Some(200),
                    breath_rate: Some(15.0),
                    tidal_volume: Some(0.5),
                    minute_volume: Some(7.5),
                    ve_zone: Some(2.0),
                    ..SourceSample::default()
                },
                DuplicatePolicy::LastWins,
            )
            .unwrap();
        source
    }

    fn run(
        base: &BaseStream,
        source: &SourceMap,
        options: &MergeOptions,
    ) -> (Vec<OutputEntry>, MergeStats) {
        let mut entries = Vec::new();
        let stats = MergeEngine::new(source, options)
            .run(base, &mut entries)
            .unwrap();
        (entries, stats)
    }

    fn merged(entries: &[OutputEntry]) -> Vec<&OutputRecord> {
        entries
            .iter()
            .filter_map(|e| match e {
                OutputEntry::Merged(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    fn assert_zero_filled(record: &OutputRecord) {
        assert!(!record.matched);
        assert_eq!(
            (record.heart_rate, record.power, record.cadence),
            (0, 0, 0)
        );
        assert_eq!(record.metrics, VentilationMetrics::default());
    }

    #[test]
    fn test_scenario_a_exact_timestamp_join() {
        let base = BaseStream::from_messages(vec![
            timeline(100, Some(80)),
            timeline(101, Some(81)),
            timeline(102, Some(82)),
        ]);
        let (entries, stats) = run(&base, &scenario_a_source(), &MergeOptions::default());
        let records = merged(&entries);
        assert_eq!(records.len(), 3);
        assert_zero_filled(records[0]);
        assert_zero_filled(records[2]);
        assert_eq!(records[0].timestamp, Some(100));
        assert_eq!(records[2].timestamp, Some(102));

        let hit = records[1];
        assert!(hit.matched);
        assert_eq!(hit.timestamp, Some(101));
        assert_eq!((hit.heart_rate, hit.power, hit.cadence), (140, 200, 0));
        assert_eq!(
            hit.metrics,
            VentilationMetrics {
                breath_rate: 15.0,
                tidal_volume: 0.5,
                minute_volume: 7.5,
                ve_zone: 2.0,
            }
        );
        assert_eq!((stats.eligible, stats.matched, stats.zero_filled), (3, 1, 2));
        assert_eq!(stats.records[1].outcome, RecordOutcome::Matched);
    }

    #[test]
    fn test_scenario_b_position_fix_is_dropped() {
        let base = BaseStream::from_messages(vec![timeline(199, Some(70)), timeline(200, None)]);
        let (entries, stats) = run(&base, &SourceMap::new(), &MergeOptions::default());
        let records = merged(&entries);
        assert_eq!(records.len(), 1);
        assert!(records.iter().all(|r| r.timestamp != Some(200)));
        assert_eq!(entries.len(), 2 + 1);
        assert_eq!(stats.position_fixes_dropped, 1);
        assert_eq!(stats.eligible, 1);
    }

    #[test]
    fn test_position_fix_pass_through_policy() {
        let fix = timeline(200, None);
        let base = BaseStream::from_messages(vec![fix.clone()]);
        let options = MergeOptions {
            position_fixes: PositionFixPolicy::PassThrough,
            ..MergeOptions::default()
        };
        let (entries, stats) = run(&base, &SourceMap::new(), &options);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], OutputEntry::PassThrough(fix));
        assert_eq!(stats.position_fixes_kept, 1);
        assert!(merged(&entries).is_empty());
    }

    #[test]
    fn test_length_and_order_with_pass_through() {
        let lap =
            FitMessage::new(MesgNum::Lap).with_field(RawField::uint32(TIMESTAMP_FIELD, 103));
        let event =
            FitMessage::new(MesgNum::Event).with_field(RawField::uint32(TIMESTAMP_FIELD, 99));
        let base = BaseStream::from_messages(vec![
            FitMessage::new(MesgNum::FileId),
            event.clone(),
            timeline(100, Some(80)),
            timeline(101, Some(81)),
            lap.clone(),
            timeline(102, Some(82)),
            FitMessage::new(MesgNum::Session),
        ]);
        let (entries, stats) = run(&base, &scenario_a_source(), &MergeOptions::default());

        assert_eq!(entries.len(), base.len() + 2);
        assert!(matches!(entries[0], OutputEntry::FileId(_)));
        assert!(matches!(entries[1], OutputEntry::DeveloperSchema(_)));
        assert!(entries[2..].iter().all(|e| !e.is_metadata()));
        assert_eq!(entries[3], OutputEntry::PassThrough(event));
        assert_eq!(entries[6], OutputEntry::PassThrough(lap));
        let order: Vec<_> = merged(&entries).iter().map(|r| r.timestamp).collect();
        assert_eq!(order, vec![Some(100), Some(101), Some(102)]);
        assert_eq!(stats.passed_through, 4);
    }

    #[test]
    fn test_zero_fill_without_overlap() {
        let mut source = SourceMap::new();
        for ts in 500..510 {
            source
                .insert(
                    ts,
                    SourceSample {
                        heart_rate: Some(150),
                        breath_rate: Some(30.0),
                        ..SourceSample::default()
                    },
                    DuplicatePolicy::LastWins,
                )
                .unwrap();
        }
        let base = BaseStream::from_messages((100..110).map(|ts| timeline(ts, Some(60))).collect());
        let (entries, stats) = run(&base, &source, &MergeOptions::default());
        let records = merged(&entries);
        assert_eq!(records.len(), 10);
        records.iter().for_each(|r| assert_zero_filled(r));
        assert_eq!(stats.matched, 0);
    }

    #[test]
    fn test_absent_sample_fields_are_zero() {
        let mut source = SourceMap::new();
        source
            .insert(
                7,
                SourceSample {
                    cadence: Some(88),
                    ..SourceSample::default()
                },
                DuplicatePolicy::LastWins,
            )
            .unwrap();
        let base = BaseStream::from_messages(vec![timeline(7, Some(120))]);
        let (entries, _) = run(&base, &source, &MergeOptions::default());
        let record = merged(&entries)[0];
        assert!(record.matched);
        assert_eq!((record.heart_rate, record.power, record.cadence), (0, 0, 88));
        assert_eq!(record.metrics, VentilationMetrics::default());
    }

    #[test]
    fn test_record_without_timestamp_is_zero_filled() {
        let message = FitMessage::new(MesgNum::Record)
            .with_field(RawField::uint8(RecordField::HeartRate.number(), 90));
        let base = BaseStream::from_messages(vec![message]);
        let (entries, stats) = run(&base, &scenario_a_source(), &MergeOptions::default());
        let record = merged(&entries)[0];
        assert_eq!(record.timestamp, None);
        assert_zero_filled(record);
        assert_eq!(stats.zero_filled, 1);
    }

    #[test]
    fn test_schema_slots_match_record_developer_fields() {
        let base = BaseStream::from_messages((100..103).map(|ts| timeline(ts, Some(60))).collect());
        let (entries, _) = run(&base, &scenario_a_source(), &MergeOptions::default());
        let schema = match &entries[1] {
            OutputEntry::DeveloperSchema(schema) => schema.clone(),
            other => panic!("expected schema, got {:?}", other),
        };
        let slots: Vec<_> = schema.fields().iter().map(|f| f.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        for record in merged(&entries) {
            let message = record.to_message(&schema);
            let written: Vec<_> = message
                .developer_fields
                .iter()
                .filter(|d| d.data_index == schema.developer_data_index())
                .map(|d| d.number())
                .collect();
            assert_eq!(written, slots);
        }
    }

    #[test]
    fn test_schema_index_avoids_base_developer_data() {
        let base = BaseStream::from_messages(vec![
            FitMessage::new(MesgNum::DeveloperDataId).with_field(RawField::uint8(3, 0)),
            timeline(1, Some(60)),
        ]);
        let (entries, _) = run(&base, &SourceMap::new(), &MergeOptions::default());
        match &entries[1] {
            OutputEntry::DeveloperSchema(schema) => assert_eq!(schema.developer_data_index(), 1),
            other => panic!("expected schema, got {:?}", other),
        }
    }

    #[test]
    fn test_file_identity_defaults_to_first_base_timestamp() {
        let base = BaseStream::from_messages(vec![timeline(4242, Some(60))]);
        let (entries, _) = run(&base, &SourceMap::new(), &MergeOptions::default());
        match &entries[0] {
            OutputEntry::FileId(identity) => assert_eq!(identity.time_created, Some(4242)),
            other => panic!("expected file id, got {:?}", other),
        }
    }

    #[test]
    fn test_engine_runs_once() {
        let base = BaseStream::from_messages(vec![timeline(1, Some(60))]);
        let source = SourceMap::new();
        let options = MergeOptions::default();
        let mut engine = MergeEngine::new(&source, &options);
        let mut sink = FitFileSink::new(Vec::new());
        engine.run(&base, &mut sink).unwrap();
        let err = engine.run(&base, &mut sink).unwrap_err();
        assert!(matches!(err, MergeError::MetadataAfterData));
    }

    #[test]
    fn test_options_from_json() {
        let options = MergeOptions::from_json(
            r#"{"duplicates": "first_wins", "position_fixes": "pass_through",
                "file_identity": {"product": 7}}"#,
        )
        .unwrap();
        assert_eq!(options.duplicates, DuplicatePolicy::FirstWins);
        assert_eq!(options.position_fixes, PositionFixPolicy::PassThrough);
        assert_eq!(options.file_identity.product, 7);
        assert_eq!(options.file_identity.manufacturer, 1);
        assert!(MergeOptions::from_json("{\"duplicates\": 3}").is_err());
    }
}
