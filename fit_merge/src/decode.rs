//! Lossless FIT decoder.

use std::collections::HashMap;

use tracing::debug;

use crate::fit::{
    crc16, BaseType, DevField, FieldDescription, FitMessage, RawField, TIMESTAMP_FIELD,
};
use crate::profile::MesgNum;
use crate::{MergeError, Result};

const LOCAL_TYPES: usize = 16;

/// Every message of a FIT file in file order, plus the developer field
/// descriptions seen while decoding.
#[derive(Clone, Debug, Default)]
pub struct FitFile {
    pub messages: Vec<FitMessage>,
    pub field_descriptions: HashMap<(u8, u8), FieldDescription>,
}

impl FitFile {
    /// Physical value of a developer field using its declared scale and offset.
    pub fn developer_value(&self, field: &DevField) -> Option<f64> {
        let raw = field.field.as_f64()?;
        match self
            .field_descriptions
            .get(&(field.data_index, field.number()))
        {
            Some(desc) => Some(desc.physical_value(raw)),
            None => Some(raw),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FieldDef {
    number: u8,
    size: u8,
    base_type: BaseType,
}

#[derive(Clone, Copy, Debug)]
struct DevFieldDef {
    number: u8,
    size: u8,
    data_index: u8,
}

#[derive(Clone, Debug)]
struct Definition {
    big_endian: bool,
    global: u16,
    fields: Vec<FieldDef>,
    dev_fields: Vec<DevFieldDef>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            MergeError::Decode(format!(
                "record truncated at byte {} (needed {} more)",
                self.pos,
                end - self.data.len().min(end)
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

#[derive(Default)]
struct Decoder {
    definitions: Vec<Option<Definition>>,
    last_timestamp: Option<u32>,
    file: FitFile,
    containers: usize,
}

/// Decode a FIT file, including chained containers, validating header and file CRCs.
pub fn decode(bytes: &[u8]) -> Result<FitFile> {
    let mut decoder = Decoder::default();
    let mut offset = 0;
    while offset < bytes.len() {
        offset += decoder.decode_container(&bytes[offset..])?;
    }
    if decoder.containers == 0 {
        return Err(MergeError::Decode("empty input".into()));
    }
    debug!(
        "Decoded {} messages from {} container(s)",
        decoder.file.messages.len(),
        decoder.containers
    );
    Ok(decoder.file)
}

impl Decoder {
    fn decode_container(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() < 12 {
            return Err(MergeError::Decode(format!(
                "truncated header ({} bytes)",
                data.len()
            )));
        }
        let header_size = usize::from(data[0]);
        if header_size != 12 && header_size != 14 {
            return Err(MergeError::Decode(format!(
                "unsupported header size {}",
                header_size
            )));
        }
        if data.len() < header_size {
            return Err(MergeError::Decode("truncated header".into()));
        }
        if &data[8..12] != b".FIT" {
            return Err(MergeError::Decode("missing .FIT signature".into()));
        }
        if header_size == 14 {
            let stored = u16::from_le_bytes([data[12], data[13]]);
            let computed = crc16(0, &data[..12]);
            if stored != 0 && stored != computed {
                return Err(MergeError::Crc {
                    expected: stored,
                    found: computed,
                });
            }
        }
        let data_size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let end = header_size + data_size;
        if data.len() < end + 2 {
            return Err(MergeError::Decode(format!(
                "file truncated: header declares {} data bytes, {} available",
                data_size,
                data.len().saturating_sub(header_size + 2)
            )));
        }
        let stored = u16::from_le_bytes([data[end], data[end + 1]]);
        let computed = crc16(0, &data[..end]);
        if stored != computed {
            return Err(MergeError::Crc {
                expected: stored,
                found: computed,
            });
        }

        self.definitions = vec![None; LOCAL_TYPES];
        let mut cursor = Cursor::new(&data[header_size..end]);
        while !cursor.is_empty() {
            self.decode_record(&mut cursor)?;
        }
        self.containers += 1;
        Ok(end + 2)
    }

    fn decode_record(&mut self, cursor: &mut Cursor<'_>) -> Result<()> {
        let header = cursor.u8()?;
        if header & 0x80 != 0 {
            let local = usize::from((header >> 5) & 0x03);
            let timestamp = self.resolve_compressed(header & 0x1F)?;
            let mut message = self.decode_data(local, cursor)?;
            if message.field(TIMESTAMP_FIELD).is_none() {
                message
                    .fields
                    .push(RawField::uint32(TIMESTAMP_FIELD, timestamp));
            }
            self.push(message);
        } else if header & 0x40 != 0 {
            let local = usize::from(header & 0x0F);
            let definition = decode_definition(cursor, header & 0x20 != 0)?;
            self.definitions[local] = Some(definition);
        } else {
            let local = usize::from(header & 0x0F);
            let message = self.decode_data(local, cursor)?;
            if let Some(ts) = message.timestamp() {
                self.last_timestamp = Some(ts);
            }
            self.push(message);
        }
        Ok(())
    }

    fn resolve_compressed(&mut self, offset: u8) -> Result<u32> {
        let last = self.last_timestamp.ok_or_else(|| {
            MergeError::Decode("compressed timestamp before any full timestamp".into())
        })?;
        let offset = u32::from(offset);
        let mut timestamp = (last & !0x1F).wrapping_add(offset);
        if offset < (last & 0x1F) {
            timestamp = timestamp.wrapping_add(0x20);
        }
        self.last_timestamp = Some(timestamp);
        Ok(timestamp)
    }

    fn decode_data(&self, local: usize, cursor: &mut Cursor<'_>) -> Result<FitMessage> {
        let definition = self
            .definitions
            .get(local)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                MergeError::Decode(format!("data message for undefined local type {}", local))
            })?;

        let mut message = FitMessage {
            global: definition.global,
            fields: Vec::with_capacity(definition.fields.len()),
            developer_fields: Vec::with_capacity(definition.dev_fields.len()),
        };
        for def in &definition.fields {
            let raw = cursor.take(usize::from(def.size))?;
            let base_type = if usize::from(def.size) % def.base_type.size() == 0 {
                def.base_type
            } else {
                BaseType::Byte
            };
            let bytes = normalize(raw, base_type, definition.big_endian);
            message.fields.push(RawField::new(def.number, base_type, bytes));
        }
        for def in &definition.dev_fields {
            let raw = cursor.take(usize::from(def.size))?;
            let base_type = self
                .file
                .field_descriptions
                .get(&(def.data_index, def.number))
                .map(|d| d.base_type)
                .filter(|b| usize::from(def.size) % b.size() == 0)
                .unwrap_or(BaseType::Byte);
            let bytes = normalize(raw, base_type, definition.big_endian);
            message.developer_fields.push(DevField::new(
                def.data_index,
                RawField::new(def.number, base_type, bytes),
            ));
        }
        Ok(message)
    }

    fn push(&mut self, message: FitMessage) {
        if message.kind() == MesgNum::FieldDescription {
            if let Some(desc) = FieldDescription::from_message(&message) {
                self.file
                    .field_descriptions
                    .insert((desc.developer_data_index, desc.field_number), desc);
            }
        }
        self.file.messages.push(message);
    }
}

fn decode_definition(cursor: &mut Cursor<'_>, has_dev_fields: bool) -> Result<Definition> {
    let _reserved = cursor.u8()?;
    let big_endian = match cursor.u8()? {
        0 => false,
        1 => true,
        other => {
            return Err(MergeError::Decode(format!(
                "invalid architecture byte {}",
                other
            )))
        }
    };
    let global_bytes = cursor.take(2)?;
    let global = if big_endian {
        u16::from_be_bytes([global_bytes[0], global_bytes[1]])
    } else {
        u16::from_le_bytes([global_bytes[0], global_bytes[1]])
    };
    let count = cursor.u8()?;
    let mut fields = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let raw = cursor.take(3)?;
        fields.push(FieldDef {
            number: raw[0],
            size: raw[1],
            base_type: BaseType::from_code(raw[2]).unwrap_or(BaseType::Byte),
        });
    }
    let mut dev_fields = Vec::new();
    if has_dev_fields {
        let count = cursor.u8()?;
        for _ in 0..count {
            let raw = cursor.take(3)?;
            dev_fields.push(DevFieldDef {
                number: raw[0],
                size: raw[1],
                data_index: raw[2],
            });
        }
    }
    Ok(Definition {
        big_endian,
        global,
        fields,
        dev_fields,
    })
}

fn normalize(raw: &[u8], base_type: BaseType, big_endian: bool) -> Vec<u8> {
    let size = base_type.size();
    if !big_endian || size == 1 {
        return raw.to_vec();
    }
    raw.chunks(size)
        .flat_map(|chunk| chunk.iter().rev().copied())
        .collect()
}
