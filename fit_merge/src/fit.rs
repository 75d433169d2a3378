//! Raw FIT container model shared by the decoder and encoder.
//!
//! Field payloads are kept as little-endian bytes exactly as they appeared on the
//! wire, so messages that are only passed through can be re-encoded without loss.

use chrono::{DateTime, TimeZone, Utc};

use crate::profile::{FieldDescriptionField, MesgNum};

/// Seconds between the Unix epoch and the FIT epoch (1989-12-31T00:00:00Z).
pub const FIT_EPOCH_OFFSET: i64 = 631_065_600;

/// Field number of the `timestamp` field, common to every message kind.
pub const TIMESTAMP_FIELD: u8 = 253;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BaseType {
    Enum,
    SInt8,
    UInt8,
    SInt16,
    UInt16,
    SInt32,
    UInt32,
    String,
    Float32,
    Float64,
    UInt8z,
    UInt16z,
    UInt32z,
    Byte,
    SInt64,
    UInt64,
    UInt64z,
}

impl BaseType {
    /// Resolve a base type from its wire code. The endian-ability bit is ignored.
    pub fn from_code(code: u8) -> Option<Self> {
        let base = match code & 0x1F {
            0 => BaseType::Enum,
            1 => BaseType::SInt8,
            2 => BaseType::UInt8,
            3 => BaseType::SInt16,
            4 => BaseType::UInt16,
            5 => BaseType::SInt32,
            6 => BaseType::UInt32,
            7 => BaseType::String,
            8 => BaseType::Float32,
            9 => BaseType::Float64,
            10 => BaseType::UInt8z,
            11 => BaseType::UInt16z,
            12 => BaseType::UInt32z,
            13 => BaseType::Byte,
            14 => BaseType::SInt64,
            15 => BaseType::UInt64,
            16 => BaseType::UInt64z,
            _ => return None,
        };
        Some(base)
    }

    pub fn code(self) -> u8 {
        match self {
            BaseType::Enum => 0x00,
            BaseType::SInt8 => 0x01,
            BaseType::UInt8 => 0x02,
            BaseType::SInt16 => 0x83,
            BaseType::UInt16 => 0x84,
            BaseType::SInt32 => 0x85,
            BaseType::UInt32 => 0x86,
            BaseType::String => 0x07,
            BaseType::Float32 => 0x88,
            BaseType::Float64 => 0x89,
            BaseType::UInt8z => 0x0A,
            BaseType::UInt16z => 0x8B,
            BaseType::UInt32z => 0x8C,
            BaseType::Byte => 0x0D,
            BaseType::SInt64 => 0x8E,
            BaseType::UInt64 => 0x8F,
            BaseType::UInt64z => 0x90,
        }
    }

    /// Size in bytes of a single element.
    pub fn size(self) -> usize {
        match self {
            BaseType::Enum
            | BaseType::SInt8
            | BaseType::UInt8
            | BaseType::String
            | BaseType::UInt8z
            | BaseType::Byte => 1,
            BaseType::SInt16 | BaseType::UInt16 | BaseType::UInt16z => 2,
            BaseType::SInt32 | BaseType::UInt32 | BaseType::Float32 | BaseType::UInt32z => 4,
            BaseType::Float64 | BaseType::SInt64 | BaseType::UInt64 | BaseType::UInt64z => 8,
        }
    }

    /// Largest raw unsigned value that is not the type's invalid sentinel.
    pub fn max_unsigned(self) -> Option<u64> {
        match self {
            BaseType::Enum | BaseType::UInt8 | BaseType::Byte => Some(0xFE),
            BaseType::UInt8z => Some(0xFF),
            BaseType::UInt16 => Some(0xFFFE),
            BaseType::UInt16z => Some(0xFFFF),
            BaseType::UInt32 => Some(0xFFFF_FFFE),
            BaseType::UInt32z => Some(0xFFFF_FFFF),
            BaseType::UInt64 => Some(u64::MAX - 1),
            BaseType::UInt64z => Some(u64::MAX),
            _ => None,
        }
    }

    fn is_invalid(self, element: &[u8]) -> bool {
        let raw = le_u64(element);
        match self {
            BaseType::Enum | BaseType::UInt8 | BaseType::Byte => raw == 0xFF,
            BaseType::SInt8 => raw == 0x7F,
            BaseType::SInt16 => raw == 0x7FFF,
            BaseType::UInt16 => raw == 0xFFFF,
            BaseType::SInt32 => raw == 0x7FFF_FFFF,
            BaseType::UInt32 | BaseType::Float32 => raw == 0xFFFF_FFFF,
            BaseType::SInt64 => raw == 0x7FFF_FFFF_FFFF_FFFF,
            BaseType::UInt64 | BaseType::Float64 => raw == u64::MAX,
            BaseType::UInt8z | BaseType::UInt16z | BaseType::UInt32z | BaseType::UInt64z => {
                raw == 0
            }
            BaseType::String => element.first().map_or(true, |b| *b == 0),
        }
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}

/// A single numbered field with its payload normalized to little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawField {
    pub number: u8,
    pub base_type: BaseType,
    pub bytes: Vec<u8>,
}

impl RawField {
    pub fn new(number: u8, base_type: BaseType, bytes: Vec<u8>) -> Self {
        Self {
            number,
            base_type,
            bytes,
        }
    }

    pub fn uint8(number: u8, value: u8) -> Self {
        Self::new(number, BaseType::UInt8, vec![value])
    }

    pub fn sint8(number: u8, value: i8) -> Self {
        Self::new(number, BaseType::SInt8, value.to_le_bytes().to_vec())
    }

    pub fn enumeration(number: u8, value: u8) -> Self {
        Self::new(number, BaseType::Enum, vec![value])
    }

    pub fn uint16(number: u8, value: u16) -> Self {
        Self::new(number, BaseType::UInt16, value.to_le_bytes().to_vec())
    }

    pub fn uint32(number: u8, value: u32) -> Self {
        Self::new(number, BaseType::UInt32, value.to_le_bytes().to_vec())
    }

    pub fn uint32z(number: u8, value: u32) -> Self {
        Self::new(number, BaseType::UInt32z, value.to_le_bytes().to_vec())
    }

    pub fn sint32(number: u8, value: i32) -> Self {
        Self::new(number, BaseType::SInt32, value.to_le_bytes().to_vec())
    }

    /// Null-terminated string field.
    pub fn string(number: u8, value: &str) -> Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        Self::new(number, BaseType::String, bytes)
    }

    /// First element of the payload, `None` when it holds the invalid sentinel.
    fn element(&self) -> Option<&[u8]> {
        let size = self.base_type.size();
        let element = self.bytes.get(..size)?;
        if self.base_type.is_invalid(element) {
            None
        } else {
            Some(element)
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.base_type {
            BaseType::Float32
            | BaseType::Float64
            | BaseType::String
            | BaseType::SInt8
            | BaseType::SInt16
            | BaseType::SInt32
            | BaseType::SInt64 => None,
            _ => self.element().map(le_u64),
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.as_u64().and_then(|v| u8::try_from(v).ok())
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        let element = self.element()?;
        let raw = le_u64(element);
        match self.base_type {
            BaseType::SInt8 => Some(i64::from(raw as u8 as i8)),
            BaseType::SInt16 => Some(i64::from(raw as u16 as i16)),
            BaseType::SInt32 => Some(i64::from(raw as u32 as i32)),
            BaseType::SInt64 => Some(raw as i64),
            _ => self.as_u64().and_then(|v| i64::try_from(v).ok()),
        }
    }

    /// Numeric value of the first element without any profile scaling.
    pub fn as_f64(&self) -> Option<f64> {
        match self.base_type {
            BaseType::Float32 => {
                let element = self.element()?;
                let bits = u32::try_from(le_u64(element)).ok()?;
                Some(f64::from(f32::from_bits(bits)))
            }
            BaseType::Float64 => self.element().map(|e| f64::from_bits(le_u64(e))),
            BaseType::String => None,
            BaseType::SInt8 | BaseType::SInt16 | BaseType::SInt32 | BaseType::SInt64 => {
                self.as_i64().map(|v| v as f64)
            }
            _ => self.as_u64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if self.base_type != BaseType::String {
            return None;
        }
        let end = self
            .bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.bytes.len());
        if end == 0 {
            return None;
        }
        std::str::from_utf8(&self.bytes[..end]).ok()
    }
}

/// A developer field value, addressed by `(data_index, field.number)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevField {
    pub data_index: u8,
    pub field: RawField,
}

impl DevField {
    pub fn new(data_index: u8, field: RawField) -> Self {
        Self { data_index, field }
    }

    pub fn number(&self) -> u8 {
        self.field.number
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FitMessage {
    pub global: u16,
    pub fields: Vec<RawField>,
    pub developer_fields: Vec<DevField>,
}

impl FitMessage {
    pub fn new(kind: MesgNum) -> Self {
        Self {
            global: kind.as_u16(),
            fields: Vec::new(),
            developer_fields: Vec::new(),
        }
    }

    pub fn kind(&self) -> MesgNum {
        MesgNum::from_u16(self.global)
    }

    pub fn field(&self, number: u8) -> Option<&RawField> {
        self.fields.iter().find(|f| f.number == number)
    }

    pub fn timestamp(&self) -> Option<u32> {
        self.field(TIMESTAMP_FIELD).and_then(RawField::as_u32)
    }

    /// Look up a developer field by slot; `data_index` of `None` matches any index.
    pub fn developer_field(&self, data_index: Option<u8>, number: u8) -> Option<&DevField> {
        self.developer_fields
            .iter()
            .find(|d| d.number() == number && data_index.map_or(true, |idx| idx == d.data_index))
    }

    pub fn with_field(mut self, field: RawField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_developer_field(mut self, field: DevField) -> Self {
        self.developer_fields.push(field);
        self
    }
}

/// Declared type and scaling of one developer field, as carried by a
/// `field_description` message.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescription {
    pub developer_data_index: u8,
    pub field_number: u8,
    pub base_type: BaseType,
    pub name: Option<String>,
    pub scale: Option<u8>,
    pub offset: Option<i8>,
    pub units: Option<String>,
    pub native_mesg_num: Option<u16>,
}

impl FieldDescription {
    pub fn from_message(message: &FitMessage) -> Option<Self> {
        if message.kind() != MesgNum::FieldDescription {
            return None;
        }
        let get = |f: FieldDescriptionField| message.field(f.number());
        let developer_data_index = get(FieldDescriptionField::DeveloperDataIndex)?.as_u8()?;
        let field_number = get(FieldDescriptionField::FieldDefinitionNumber)?.as_u8()?;
        let base_type = get(FieldDescriptionField::FitBaseTypeId)
            .and_then(RawField::as_u8)
            .and_then(BaseType::from_code)
            .unwrap_or(BaseType::Byte);
        Some(Self {
            developer_data_index,
            field_number,
            base_type,
            name: get(FieldDescriptionField::FieldName)
                .and_then(RawField::as_str)
                .map(str::to_string),
            scale: get(FieldDescriptionField::Scale).and_then(RawField::as_u8),
            offset: get(FieldDescriptionField::Offset)
                .and_then(RawField::as_i64)
                .and_then(|v| i8::try_from(v).ok()),
            units: get(FieldDescriptionField::Units)
                .and_then(RawField::as_str)
                .map(str::to_string),
            native_mesg_num: get(FieldDescriptionField::NativeMesgNum).and_then(RawField::as_u16),
        })
    }

    pub fn to_message(&self) -> FitMessage {
        let mut message = FitMessage::new(MesgNum::FieldDescription)
            .with_field(RawField::uint8(
                FieldDescriptionField::DeveloperDataIndex.number(),
                self.developer_data_index,
            ))
            .with_field(RawField::uint8(
                FieldDescriptionField::FieldDefinitionNumber.number(),
                self.field_number,
            ))
            .with_field(RawField::uint8(
                FieldDescriptionField::FitBaseTypeId.number(),
                self.base_type.code(),
            ));
        if let Some(name) = &self.name {
            message.fields.push(RawField::string(
                FieldDescriptionField::FieldName.number(),
                name,
            ));
        }
        if let Some(scale) = self.scale {
            message
                .fields
                .push(RawField::uint8(FieldDescriptionField::Scale.number(), scale));
        }
        if let Some(offset) = self.offset {
            message
                .fields
                .push(RawField::sint8(FieldDescriptionField::Offset.number(), offset));
        }
        if let Some(units) = &self.units {
            message.fields.push(RawField::string(
                FieldDescriptionField::Units.number(),
                units,
            ));
        }
        if let Some(native) = self.native_mesg_num {
            message.fields.push(RawField::uint16(
                FieldDescriptionField::NativeMesgNum.number(),
                native,
            ));
        }
        message
    }

    /// Convert a raw stored value to physical units (`raw / scale - offset`).
    pub fn physical_value(&self, raw: f64) -> f64 {
        let scale = self.scale.filter(|s| *s != 0).map_or(1.0, f64::from);
        let offset = self.offset.map_or(0.0, f64::from);
        raw / scale - offset
    }
}

const CRC_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
    0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// FIT CRC-16, processed a nibble at a time.
pub fn crc16(mut crc: u16, bytes: &[u8]) -> u16 {
    for &byte in bytes {
        let mut tmp = CRC_TABLE[usize::from(crc & 0xF)];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ CRC_TABLE[usize::from(byte & 0xF)];
        tmp = CRC_TABLE[usize::from(crc & 0xF)];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ CRC_TABLE[usize::from((byte >> 4) & 0xF)];
    }
    crc
}

pub fn fit_time_to_utc(timestamp: u32) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(FIT_EPOCH_OFFSET + i64::from(timestamp), 0)
        .single()
}
