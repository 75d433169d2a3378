//! The subset of the FIT profile this crate reads or writes by number.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MesgNum {
    FileId,
    Session,
    Lap,
    Record,
    Event,
    DeviceInfo,
    Activity,
    FieldDescription,
    DeveloperDataId,
    Other(u16),
}

impl MesgNum {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => MesgNum::FileId,
            18 => MesgNum::Session,
            19 => MesgNum::Lap,
            20 => MesgNum::Record,
            21 => MesgNum::Event,
            23 => MesgNum::DeviceInfo,
            34 => MesgNum::Activity,
            206 => MesgNum::FieldDescription,
            207 => MesgNum::DeveloperDataId,
            other => MesgNum::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            MesgNum::FileId => 0,
            MesgNum::Session => 18,
            MesgNum::Lap => 19,
            MesgNum::Record => 20,
            MesgNum::Event => 21,
            MesgNum::DeviceInfo => 23,
            MesgNum::Activity => 34,
            MesgNum::FieldDescription => 206,
            MesgNum::DeveloperDataId => 207,
            MesgNum::Other(value) => value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordField {
    PositionLat = 0,
    PositionLong = 1,
    HeartRate = 3,
    Cadence = 4,
    Distance = 5,
    Power = 7,
    FractionalCadence = 53,
    Timestamp = 253,
}

impl RecordField {
    pub const fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileIdField {
    Type = 0,
    Manufacturer = 1,
    Product = 2,
    SerialNumber = 3,
    TimeCreated = 4,
}

impl FileIdField {
    pub const fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DeveloperDataIdField {
    DeveloperDataIndex = 3,
    ApplicationVersion = 4,
}

impl DeveloperDataIdField {
    pub const fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldDescriptionField {
    DeveloperDataIndex = 0,
    FieldDefinitionNumber = 1,
    FitBaseTypeId = 2,
    FieldName = 3,
    Scale = 6,
    Offset = 7,
    Units = 8,
    NativeMesgNum = 14,
}

impl FieldDescriptionField {
    pub const fn number(self) -> u8 {
        self as u8
    }
}

/// `file` enum value for activity files.
pub const FILE_TYPE_ACTIVITY: u8 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesg_num_mapping() {
        for raw in [0u16, 18, 19, 20, 21, 23, 34, 206, 207, 49, 65280] {
            assert_eq!(MesgNum::from_u16(raw).as_u16(), raw);
        }
        assert_eq!(MesgNum::from_u16(20), MesgNum::Record);
        assert_eq!(MesgNum::from_u16(49), MesgNum::Other(49));
    }
}
