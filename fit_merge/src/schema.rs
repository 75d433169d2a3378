//! Developer field schema written ahead of the merged records.

use serde::{Deserialize, Serialize};

use crate::fit::{BaseType, DevField, FieldDescription, FitMessage, RawField};
use crate::profile::{DeveloperDataIdField, MesgNum};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeveloperMetric {
    BreathRate,
    TidalVolume,
    MinuteVolume,
    VentilationZone,
}

impl DeveloperMetric {
    pub const ALL: [DeveloperMetric; 4] = [
        DeveloperMetric::BreathRate,
        DeveloperMetric::TidalVolume,
        DeveloperMetric::MinuteVolume,
        DeveloperMetric::VentilationZone,
    ];

    pub fn field_name(self) -> &'static str {
        match self {
            DeveloperMetric::BreathRate => "breath_rate",
            DeveloperMetric::TidalVolume => "tidal_volume",
            DeveloperMetric::MinuteVolume => "minute_volume",
            DeveloperMetric::VentilationZone => "ve_zone",
        }
    }

    fn storage(self) -> (BaseType, u8, &'static str) {
        match self {
            DeveloperMetric::BreathRate => (BaseType::UInt16, 100, "breaths/min"),
            DeveloperMetric::TidalVolume => (BaseType::UInt16, 100, "L"),
            DeveloperMetric::MinuteVolume => (BaseType::UInt16, 100, "L/min"),
            DeveloperMetric::VentilationZone => (BaseType::UInt8, 1, "zone"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeveloperFieldDecl {
    pub metric: DeveloperMetric,
    pub slot: u8,
    pub base_type: BaseType,
    pub scale: u8,
    pub units: &'static str,
}

impl DeveloperFieldDecl {
    /// Store a physical value as the declared unsigned raw type, clamped below the
    /// invalid sentinel. Negative and non-finite values store as zero.
    pub fn encode(&self, data_index: u8, value: f64) -> DevField {
        let max = self.base_type.max_unsigned().unwrap_or(0) as f64;
        let scaled = (value * f64::from(self.scale)).round();
        let raw = if scaled.is_finite() {
            scaled.clamp(0.0, max) as u64
        } else {
            0
        };
        let bytes = raw.to_le_bytes()[..self.base_type.size()].to_vec();
        DevField::new(data_index, RawField::new(self.slot, self.base_type, bytes))
    }
}

/// Ordered developer field declarations. Slots are dense from zero in
/// declaration order and are the numbers written on every merged record.
#[derive(Clone, Debug, PartialEq)]
pub struct DeveloperFieldSchema {
    developer_data_index: u8,
    fields: Vec<DeveloperFieldDecl>,
}

impl DeveloperFieldSchema {
    pub fn new(developer_data_index: u8, metrics: &[DeveloperMetric]) -> Self {
        let fields = metrics
            .iter()
            .enumerate()
            .map(|(slot, &metric)| {
                let (base_type, scale, units) = metric.storage();
                DeveloperFieldDecl {
                    metric,
                    slot: slot as u8,
                    base_type,
                    scale,
                    units,
                }
            })
            .collect();
        Self {
            developer_data_index,
            fields,
        }
    }

    /// Breath rate, tidal volume, minute volume and ventilation zone at slots 0..3.
    pub fn ventilation(developer_data_index: u8) -> Self {
        Self::new(developer_data_index, &DeveloperMetric::ALL)
    }

    pub fn developer_data_index(&self) -> u8 {
        self.developer_data_index
    }

    pub fn fields(&self) -> &[DeveloperFieldDecl] {
        &self.fields
    }

    pub fn slot_of(&self, metric: DeveloperMetric) -> Option<u8> {
        self.fields.iter().find(|f| f.metric == metric).map(|f| f.slot)
    }

    pub fn descriptions(&self) -> Vec<FieldDescription> {
        self.fields
            .iter()
            .map(|decl| FieldDescription {
                developer_data_index: self.developer_data_index,
                field_number: decl.slot,
                base_type: decl.base_type,
                name: Some(decl.metric.field_name().to_string()),
                scale: Some(decl.scale),
                offset: None,
                units: Some(decl.units.to_string()),
                native_mesg_num: Some(MesgNum::Record.as_u16()),
            })
            .collect()
    }

    /// Wire form: one `developer_data_id` followed by one `field_description` per field.
    pub fn to_messages(&self) -> Vec<FitMessage> {
        let mut messages = Vec::with_capacity(self.fields.len() + 1);
        messages.push(
            FitMessage::new(MesgNum::DeveloperDataId)
                .with_field(RawField::uint8(
                    DeveloperDataIdField::DeveloperDataIndex.number(),
                    self.developer_data_index,
                ))
                .with_field(RawField::uint32(
                    DeveloperDataIdField::ApplicationVersion.number(),
                    1,
                )),
        );
        messages.extend(self.descriptions().iter().map(FieldDescription::to_message));
        messages
    }
}
