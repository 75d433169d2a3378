//! Output entries produced by the merge engine and the sinks that consume them.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::encode::FitEncoder;
use crate::fit::{FitMessage, RawField, TIMESTAMP_FIELD};
use crate::profile::{FileIdField, MesgNum, RecordField, FILE_TYPE_ACTIVITY};
use crate::schema::{DeveloperFieldSchema, DeveloperMetric};
use crate::{MergeError, Result, Timestamp};

/// Identity written as the first message of the merged file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileIdentity {
    pub manufacturer: u16,
    pub product: u16,
    pub serial_number: u32,
    /// Defaults to the first base timestamp when unset.
    pub time_created: Option<Timestamp>,
}

impl Default for FileIdentity {
    fn default() -> Self {
        Self {
            manufacturer: 1,
            product: 1234,
            serial_number: 1,
            time_created: None,
        }
    }
}

impl FileIdentity {
    pub fn to_message(&self) -> FitMessage {
        let mut message = FitMessage::new(MesgNum::FileId)
            .with_field(RawField::enumeration(
                FileIdField::Type.number(),
                FILE_TYPE_ACTIVITY,
            ))
            .with_field(RawField::uint16(
                FileIdField::Manufacturer.number(),
                self.manufacturer,
            ))
            .with_field(RawField::uint16(FileIdField::Product.number(), self.product))
            .with_field(RawField::uint32z(
                FileIdField::SerialNumber.number(),
                self.serial_number,
            ));
        if let Some(created) = self.time_created {
            message
                .fields
                .push(RawField::uint32(FileIdField::TimeCreated.number(), created));
        }
        message
    }
}

/// Developer metrics carried by a merged record, in physical units.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VentilationMetrics {
    pub breath_rate: f64,
    pub tidal_volume: f64,
    pub minute_volume: f64,
    pub ve_zone: f64,
}

impl VentilationMetrics {
    pub fn value(&self, metric: DeveloperMetric) -> f64 {
        match metric {
            DeveloperMetric::BreathRate => self.breath_rate,
            DeveloperMetric::TidalVolume => self.tidal_volume,
            DeveloperMetric::MinuteVolume => self.minute_volume,
            DeveloperMetric::VentilationZone => self.ve_zone,
        }
    }
}

/// Base record fields replaced by merged values.
const REPLACED_FIELDS: [u8; 5] = [
    RecordField::Timestamp.number(),
    RecordField::HeartRate.number(),
    RecordField::Cadence.number(),
    RecordField::Power.number(),
    RecordField::FractionalCadence.number(),
];

/// One merged timeline record.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRecord {
    pub timestamp: Option<Timestamp>,
    pub heart_rate: u8,
    pub power: u16,
    pub cadence: u8,
    pub metrics: VentilationMetrics,
    pub matched: bool,
    /// The base record the values were merged onto.
    pub base: FitMessage,
}

impl OutputRecord {
    pub fn to_message(&self, schema: &DeveloperFieldSchema) -> FitMessage {
        let mut message = FitMessage::new(MesgNum::Record);
        if let Some(ts) = self.timestamp {
            message.fields.push(RawField::uint32(TIMESTAMP_FIELD, ts));
        }
        message.fields.extend(
            self.base
                .fields
                .iter()
                .filter(|f| !REPLACED_FIELDS.contains(&f.number))
                .cloned(),
        );
        message.fields.push(RawField::uint8(
            RecordField::HeartRate.number(),
            self.heart_rate,
        ));
        message
            .fields
            .push(RawField::uint8(RecordField::Cadence.number(), self.cadence));
        message
            .fields
            .push(RawField::uint16(RecordField::Power.number(), self.power));

        message.developer_fields = self
            .base
            .developer_fields
            .iter()
            .filter(|d| d.data_index != schema.developer_data_index())
            .cloned()
            .collect();
        for decl in schema.fields() {
            message.developer_fields.push(decl.encode(
                schema.developer_data_index(),
                self.metrics.value(decl.metric),
            ));
        }
        message
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputEntry {
    FileId(FileIdentity),
    DeveloperSchema(DeveloperFieldSchema),
    PassThrough(FitMessage),
    Merged(OutputRecord),
}

impl OutputEntry {
    pub fn is_metadata(&self) -> bool {
        matches!(self, OutputEntry::FileId(_) | OutputEntry::DeveloperSchema(_))
    }
}

pub trait OutputSink {
    fn emit(&mut self, entry: OutputEntry) -> Result<()>;
}

impl OutputSink for Vec<OutputEntry> {
    fn emit(&mut self, entry: OutputEntry) -> Result<()> {
        self.push(entry);
        Ok(())
    }
}

/// Encodes output entries into a FIT file.
pub struct FitFileSink<W: Write> {
    encoder: FitEncoder<W>,
    schema: Option<DeveloperFieldSchema>,
    data_started: bool,
}

impl<W: Write> FitFileSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            encoder: FitEncoder::new(writer),
            schema: None,
            data_started: false,
        }
    }

    pub fn finish(self) -> Result<W> {
        self.encoder.finish()
    }
}

impl<W: Write> OutputSink for FitFileSink<W> {
    fn emit(&mut self, entry: OutputEntry) -> Result<()> {
        if entry.is_metadata() && self.data_started {
            return Err(MergeError::MetadataAfterData);
        }
        match entry {
            OutputEntry::FileId(identity) => self.encoder.write_message(&identity.to_message()),
            OutputEntry::DeveloperSchema(schema) => {
                for message in schema.to_messages() {
                    self.encoder.write_message(&message)?;
                }
                self.schema = Some(schema);
                Ok(())
            }
            OutputEntry::PassThrough(message) => {
                self.data_started = true;
                self.encoder.write_message(&message)
            }
            OutputEntry::Merged(record) => {
                self.data_started = true;
                let schema = self.schema.as_ref().ok_or_else(|| {
                    MergeError::Encode("merged record before developer schema".into())
                })?;
                self.encoder.write_message(&record.to_message(schema))
            }
        }
    }
}
