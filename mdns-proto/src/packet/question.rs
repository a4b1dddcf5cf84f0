use crate::buffer::{MalformedMessage, MessageReader, MessageWriter, WriterError};

/// RR TYPE / QTYPE values this codec understands, plus the fallback used for
/// anything else so a message carrying a type we don't model can still be
/// forwarded through without dropping the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    AAAA,
    Ptr,
    Srv,
    Txt,
    HostInformation,
    Opt,
    Any,
    Unknown(u16),
}

impl RecordType {
    pub fn into_num(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ptr => 12,
            Self::HostInformation => 13,
            Self::Txt => 16,
            Self::AAAA => 28,
            Self::Srv => 33,
            Self::Opt => 41,
            Self::Any => 255,
            Self::Unknown(x) => x,
        }
    }

    pub fn from_num(num: u16) -> Self {
        match num {
            1 => Self::A,
            12 => Self::Ptr,
            13 => Self::HostInformation,
            16 => Self::Txt,
            28 => Self::AAAA,
            33 => Self::Srv,
            41 => Self::Opt,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }
}

/// CLASS / QCLASS field. The top bit is carried separately as the `unique`
/// (cache-flush / unicast-response) flag rather than folded into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    In,
    Any,
}

impl Class {
    pub fn into_num(self) -> u16 {
        match self {
            Self::In => 1,
            Self::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> Self {
        match num {
            255 => Self::Any,
            _ => Self::In,
        }
    }
}

const CACHE_FLUSH_BIT: u16 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub class: Class,
    /// Unicast-response bit in a query, cache-flush bit in an answer's class
    /// field — same wire position either way.
    pub unique: bool,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        Self {
            name: name.into(),
            qtype,
            class: Class::In,
            unique: false,
        }
    }

    pub fn read(reader: &mut MessageReader<'_>) -> Result<Self, MalformedMessage> {
        let name = reader.read_name()?;
        let qtype = RecordType::from_num(reader.read_u16()?);
        let raw_class = reader.read_u16()?;
        let (class, unique) = split_class(raw_class);

        Ok(Self {
            name,
            qtype,
            class,
            unique,
        })
    }

    pub fn write(&self, writer: &mut MessageWriter) -> Result<(), WriterError> {
        writer.write_name(&self.name)?;
        writer.write_u16(self.qtype.into_num())?;
        writer.write_u16(join_class(self.class, self.unique))
    }
}

pub(crate) fn split_class(raw: u16) -> (Class, bool) {
    (Class::from_num(raw & !CACHE_FLUSH_BIT), raw & CACHE_FLUSH_BIT != 0)
}

pub(crate) fn join_class(class: Class, unique: bool) -> u16 {
    class.into_num() | if unique { CACHE_FLUSH_BIT } else { 0 }
}
