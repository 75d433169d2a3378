//! FIT encoder. Messages are buffered so the header can carry the final data size.

use std::io::Write;

use crate::fit::{crc16, FitMessage};
use crate::{MergeError, Result};

const LOCAL_TYPES: usize = 16;
const HEADER_SIZE: u8 = 14;
const PROTOCOL_VERSION: u8 = 0x20;
const PROFILE_VERSION: u16 = 2132;

/// Wire layout of a message; identical shapes share one definition.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Shape {
    global: u16,
    fields: Vec<[u8; 3]>,
    dev_fields: Vec<[u8; 3]>,
}

impl Shape {
    fn of(message: &FitMessage) -> Result<Self> {
        if message.fields.len() > 255 || message.developer_fields.len() > 255 {
            return Err(MergeError::Encode(format!(
                "message {} has too many fields",
                message.global
            )));
        }
        let size = |len: usize, number: u8| {
            u8::try_from(len).map_err(|_| {
                MergeError::Encode(format!(
                    "field {} of message {} exceeds 255 bytes",
                    number, message.global
                ))
            })
        };
        let mut fields = Vec::with_capacity(message.fields.len());
        for field in &message.fields {
            fields.push([
                field.number,
                size(field.bytes.len(), field.number)?,
                field.base_type.code(),
            ]);
        }
        let mut dev_fields = Vec::with_capacity(message.developer_fields.len());
        for dev in &message.developer_fields {
            dev_fields.push([
                dev.number(),
                size(dev.field.bytes.len(), dev.number())?,
                dev.data_index,
            ]);
        }
        Ok(Self {
            global: message.global,
            fields,
            dev_fields,
        })
    }
}

pub struct FitEncoder<W: Write> {
    writer: W,
    body: Vec<u8>,
    locals: Vec<Option<Shape>>,
    next_local: usize,
    messages: usize,
}

impl<W: Write> FitEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            body: Vec::new(),
            locals: vec![None; LOCAL_TYPES],
            next_local: 0,
            messages: 0,
        }
    }

    pub fn messages_written(&self) -> usize {
        self.messages
    }

    pub fn write_message(&mut self, message: &FitMessage) -> Result<()> {
        let shape = Shape::of(message)?;
        let local = match self
            .locals
            .iter()
            .position(|slot| slot.as_ref() == Some(&shape))
        {
            Some(local) => local,
            None => {
                let local = self.next_local;
                self.next_local = (local + 1) % LOCAL_TYPES;
                self.write_definition(local, &shape);
                self.locals[local] = Some(shape);
                local
            }
        };

        self.body.push(local as u8);
        for field in &message.fields {
            self.body.extend_from_slice(&field.bytes);
        }
        for dev in &message.developer_fields {
            self.body.extend_from_slice(&dev.field.bytes);
        }
        self.messages += 1;
        Ok(())
    }

    fn write_definition(&mut self, local: usize, shape: &Shape) {
        let mut header = 0x40 | local as u8;
        if !shape.dev_fields.is_empty() {
            header |= 0x20;
        }
        self.body.push(header);
        self.body.push(0);
        self.body.push(0);
        self.body.extend_from_slice(&shape.global.to_le_bytes());
        self.body.push(shape.fields.len() as u8);
        for def in &shape.fields {
            self.body.extend_from_slice(def);
        }
        if !shape.dev_fields.is_empty() {
            self.body.push(shape.dev_fields.len() as u8);
            for def in &shape.dev_fields {
                self.body.extend_from_slice(def);
            }
        }
    }

    /// Write header, buffered records and file CRC, returning the inner writer.
    pub fn finish(mut self) -> Result<W> {
        let data_size = u32::try_from(self.body.len())
            .map_err(|_| MergeError::Encode("data section exceeds 4 GiB".into()))?;
        let mut header = Vec::with_capacity(usize::from(HEADER_SIZE));
        header.push(HEADER_SIZE);
        header.push(PROTOCOL_VERSION);
        header.extend_from_slice(&PROFILE_VERSION.to_le_bytes());
        header.extend_from_slice(&data_size.to_le_bytes());
        header.extend_from_slice(b".FIT");
        let header_crc = crc16(0, &header);
        header.extend_from_slice(&header_crc.to_le_bytes());

        let crc = crc16(crc16(0, &header), &self.body);
        self.writer.write_all(&header)?;
        self.writer.write_all(&self.body)?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}
