//! Source extractor: timestamp-keyed physiological samples from the source file.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decode::{decode, FitFile};
use crate::fit::{FitMessage, RawField};
use crate::profile::{MesgNum, RecordField};
use crate::{MergeError, Result, Timestamp};

pub const SLOT_MAP_VERSION: u32 = 1;

/// Values read from one source record. `None` means the field was absent or held
/// the FIT invalid value; it is never coerced to zero here.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SourceSample {
    pub heart_rate: Option<u8>,
    pub power: Option<u16>,
    pub cadence: Option<u8>,
    pub breath_rate: Option<f64>,
    pub tidal_volume: Option<f64>,
    pub minute_volume: Option<f64>,
    pub heart_rate_secondary: Option<f64>,
    pub power_secondary: Option<f64>,
    pub ve_zone: Option<f64>,
}

/// Developer field slots written by the source device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceSlotMap {
    pub version: u32,
    /// Restrict lookups to one developer data index; `None` accepts any.
    pub developer_data_index: Option<u8>,
    pub breath_rate: u8,
    pub tidal_volume: u8,
    pub minute_volume: u8,
    pub heart_rate_secondary: u8,
    pub power_secondary: u8,
    pub ve_zone: u8,
}

impl Default for SourceSlotMap {
    fn default() -> Self {
        Self {
            version: SLOT_MAP_VERSION,
            developer_data_index: None,
            breath_rate: 0,
            tidal_volume: 1,
            minute_volume: 2,
            heart_rate_secondary: 15,
            power_secondary: 16,
            ve_zone: 17,
        }
    }
}

impl SourceSlotMap {
    pub fn from_json(text: &str) -> Result<Self> {
        let map: SourceSlotMap =
            serde_json::from_str(text).map_err(|e| MergeError::InvalidSlotMap(e.to_string()))?;
        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != SLOT_MAP_VERSION {
            return Err(MergeError::InvalidSlotMap(format!(
                "unsupported version {} (expected {})",
                self.version, SLOT_MAP_VERSION
            )));
        }
        let mut slots = self.slots();
        slots.sort_unstable();
        if slots.windows(2).any(|w| w[0] == w[1]) {
            return Err(MergeError::InvalidSlotMap(format!(
                "slots must be distinct: {:?}",
                self.slots()
            )));
        }
        Ok(())
    }

    fn slots(&self) -> Vec<u8> {
        vec![
            self.breath_rate,
            self.tidal_volume,
            self.minute_volume,
            self.heart_rate_secondary,
            self.power_secondary,
            self.ve_zone,
        ]
    }
}

/// How repeated source timestamps are resolved.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    FirstWins,
    LastWins,
    Reject,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        DuplicatePolicy::LastWins
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceMap {
    samples: BTreeMap<Timestamp, SourceSample>,
    duplicates: usize,
    skipped: usize,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        timestamp: Timestamp,
        sample: SourceSample,
        policy: DuplicatePolicy,
    ) -> Result<()> {
        match self.samples.entry(timestamp) {
            Entry::Vacant(slot) => {
                slot.insert(sample);
            }
            Entry::Occupied(mut slot) => {
                self.duplicates += 1;
                debug!("Duplicate source timestamp {} ({:?})", timestamp, policy);
                match policy {
                    DuplicatePolicy::FirstWins => {}
                    DuplicatePolicy::LastWins => {
                        slot.insert(sample);
                    }
                    DuplicatePolicy::Reject => {
                        return Err(MergeError::DuplicateTimestamp(timestamp));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, timestamp: Timestamp) -> Option<&SourceSample> {
        self.samples.get(&timestamp)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of records whose timestamp had already been seen.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Number of source records skipped because they carried no timestamp.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Decode the source file and index its records by timestamp.
pub fn extract_source(
    bytes: &[u8],
    slot_map: &SourceSlotMap,
    policy: DuplicatePolicy,
) -> Result<SourceMap> {
    slot_map.validate()?;
    let file = decode(bytes)?;
    let mut map = SourceMap::new();

    for message in &file.messages {
        if message.kind() != MesgNum::Record {
            continue;
        }
        let Some(timestamp) = message.timestamp() else {
            map.skipped += 1;
            continue;
        };
        map.insert(timestamp, read_sample(&file, message, slot_map), policy)?;
    }

    info!(
        "Source samples: {} (duplicates {}, without timestamp {})",
        map.len(),
        map.duplicates,
        map.skipped
    );
    Ok(map)
}

fn read_sample(file: &FitFile, message: &FitMessage, slots: &SourceSlotMap) -> SourceSample {
    let standard = |field: RecordField| message.field(field.number());
    let developer = |slot: u8| {
        message
            .developer_field(slots.developer_data_index, slot)
            .and_then(|dev| file.developer_value(dev))
    };
    SourceSample {
        heart_rate: standard(RecordField::HeartRate).and_then(RawField::as_u8),
        power: standard(RecordField::Power).and_then(RawField::as_u16),
        cadence: standard(RecordField::Cadence).and_then(RawField::as_u8),
        breath_rate: developer(slots.breath_rate),
        tidal_volume: developer(slots.tidal_volume),
        minute_volume: developer(slots.minute_volume),
        heart_rate_secondary: developer(slots.heart_rate_secondary),
        power_secondary: developer(slots.power_secondary),
        ve_zone: developer(slots.ve_zone),
    }
}
