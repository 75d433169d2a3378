//! Base walker: the base file's messages in original order.

use std::collections::BTreeSet;

use crate::decode::decode;
use crate::fit::{FitMessage, RawField};
use crate::profile::{DeveloperDataIdField, FieldDescriptionField, MesgNum, RecordField};
use crate::{Result, Timestamp};

/// A `record` message with typed access to the fields the merge reads.
#[derive(Clone, Debug, PartialEq)]
pub struct TimelineRecord {
    message: FitMessage,
}

impl TimelineRecord {
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.message.timestamp()
    }

    pub fn heart_rate(&self) -> Option<u8> {
        self.message
            .field(RecordField::HeartRate.number())
            .and_then(RawField::as_u8)
    }

    pub fn message(&self) -> &FitMessage {
        &self.message
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BaseMessage {
    Structural(FitMessage),
    Timeline(TimelineRecord),
}

impl BaseMessage {
    pub fn from_message(message: FitMessage) -> Self {
        match message.kind() {
            MesgNum::Record => BaseMessage::Timeline(TimelineRecord { message }),
            _ => BaseMessage::Structural(message),
        }
    }

    pub fn message(&self) -> &FitMessage {
        match self {
            BaseMessage::Structural(message) => message,
            BaseMessage::Timeline(record) => record.message(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BaseStream {
    messages: Vec<BaseMessage>,
    developer_data_indices: BTreeSet<u8>,
}

impl BaseStream {
    pub fn from_messages(messages: Vec<FitMessage>) -> Self {
        let mut developer_data_indices = BTreeSet::new();
        for message in &messages {
            let declared = match message.kind() {
                MesgNum::DeveloperDataId => {
                    message.field(DeveloperDataIdField::DeveloperDataIndex.number())
                }
                MesgNum::FieldDescription => {
                    message.field(FieldDescriptionField::DeveloperDataIndex.number())
                }
                _ => None,
            };
            developer_data_indices.extend(declared.and_then(RawField::as_u8));
            developer_data_indices.extend(message.developer_fields.iter().map(|d| d.data_index));
        }
        Self {
            messages: messages.into_iter().map(BaseMessage::from_message).collect(),
            developer_data_indices,
        }
    }

    pub fn messages(&self) -> &[BaseMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn timeline_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, BaseMessage::Timeline(_)))
            .count()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.messages.iter().find_map(|m| m.message().timestamp())
    }

    /// Developer data indices declared or used by the base file.
    pub fn developer_data_indices(&self) -> &BTreeSet<u8> {
        &self.developer_data_indices
    }

    /// Lowest developer data index the base file does not already use.
    /// 0xFF is the uint8 invalid value and is never handed out.
    pub fn free_developer_data_index(&self) -> Option<u8> {
        (0..u8::MAX).find(|idx| !self.developer_data_indices.contains(idx))
    }
}

/// Decode the base file without transforming any message.
pub fn walk_base(bytes: &[u8]) -> Result<BaseStream> {
    let file = decode(bytes)?;
    Ok(BaseStream::from_messages(file.messages))
}
