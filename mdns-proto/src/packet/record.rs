use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::question::{join_class, split_class, Class, RecordType};
use crate::buffer::{MalformedMessage, MessageReader, MessageWriter, WriterError};

/// Type-specific payload of a resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Address(IpAddr),
    Pointer(String),
    Text(Vec<u8>),
    Service {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    HostInformation {
        cpu: String,
        os: String,
    },
    Opt {
        udp_payload_size: u16,
        options: Vec<u8>,
    },
    Unknown {
        qtype: u16,
        data: Vec<u8>,
    },
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Address(IpAddr::V4(_)) => RecordType::A,
            Self::Address(IpAddr::V6(_)) => RecordType::AAAA,
            Self::Pointer(_) => RecordType::Ptr,
            Self::Text(_) => RecordType::Txt,
            Self::Service { .. } => RecordType::Srv,
            Self::HostInformation { .. } => RecordType::HostInformation,
            Self::Opt { .. } => RecordType::Opt,
            Self::Unknown { qtype, .. } => RecordType::Unknown(*qtype),
        }
    }

    fn read(
        reader: &mut MessageReader<'_>,
        qtype: RecordType,
        class_raw: u16,
        rdlength: usize,
    ) -> Result<Self, MalformedMessage> {
        let rdata_start = reader.pos();
        let data = match qtype {
            RecordType::A => {
                let raw = reader.read_u32()?;
                Self::Address(IpAddr::V4(Ipv4Addr::new(
                    ((raw >> 24) & 0xFF) as u8,
                    ((raw >> 16) & 0xFF) as u8,
                    ((raw >> 8) & 0xFF) as u8,
                    (raw & 0xFF) as u8,
                )))
            }
            RecordType::AAAA => {
                let bytes = reader.read_bytes(16)?;
                let mut segments = [0u8; 16];
                segments.copy_from_slice(bytes);
                Self::Address(IpAddr::V6(Ipv6Addr::from(segments)))
            }
            RecordType::Ptr => Self::Pointer(reader.read_name()?),
            RecordType::Txt => Self::Text(reader.read_bytes(rdlength)?.to_vec()),
            RecordType::Srv => {
                let priority = reader.read_u16()?;
                let weight = reader.read_u16()?;
                let port = reader.read_u16()?;
                let target = reader.read_name()?;
                Self::Service {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::HostInformation => {
                let len = reader.read_u8()? as usize;
                let raw = String::from_utf8_lossy(reader.read_bytes(len)?).into_owned();
                let (cpu, os) = match raw.split_once(' ') {
                    Some((cpu, os)) => (cpu.to_string(), os.to_string()),
                    None => (raw, String::new()),
                };
                Self::HostInformation { cpu, os }
            }
            RecordType::Opt => {
                let udp_payload_size = class_raw;
                let options = reader.read_bytes(rdlength)?.to_vec();
                Self::Opt {
                    udp_payload_size,
                    options,
                }
            }
            RecordType::Any => Self::Unknown {
                qtype: qtype.into_num(),
                data: reader.read_bytes(rdlength)?.to_vec(),
            },
            RecordType::Unknown(num) => Self::Unknown {
                qtype: num,
                data: reader.read_bytes(rdlength)?.to_vec(),
            },
        };

        let consumed = reader.pos() - rdata_start;
        if consumed != rdlength {
            return Err(MalformedMessage {
                offset: rdata_start,
                reason: "RDATA length did not match declared RDLENGTH",
            });
        }

        Ok(data)
    }

    fn write(&self, writer: &mut MessageWriter) -> Result<(), WriterError> {
        match self {
            Self::Address(IpAddr::V4(addr)) => writer.write_bytes(&addr.octets()),
            Self::Address(IpAddr::V6(addr)) => writer.write_bytes(&addr.octets()),
            Self::Pointer(name) => writer.write_name(name),
            Self::Text(bytes) => writer.write_bytes(bytes),
            Self::Service {
                priority,
                weight,
                port,
                target,
            } => {
                writer.write_u16(*priority)?;
                writer.write_u16(*weight)?;
                writer.write_u16(*port)?;
                writer.write_name_raw(target)
            }
            Self::HostInformation { cpu, os } => {
                let combined = format!("{cpu} {os}");
                writer.write_u8(combined.len() as u8)?;
                writer.write_bytes(combined.as_bytes())
            }
            Self::Opt { options, .. } => writer.write_bytes(options),
            Self::Unknown { data, .. } => writer.write_bytes(data),
        }
    }

    /// Write an address payload into a slot whose declared type differs from
    /// the address family actually held, per the codec's cross-type
    /// normalization rule.
    fn write_in_slot(&self, writer: &mut MessageWriter, slot: RecordType) -> Result<(), WriterError> {
        match (self, slot) {
            (Self::Address(IpAddr::V4(addr)), RecordType::AAAA) => {
                writer.write_bytes(&[0u8; 12])?;
                writer.write_bytes(&addr.octets())
            }
            (Self::Address(IpAddr::V6(addr)), RecordType::A) => {
                writer.write_bytes(&addr.octets()[12..16])
            }
            _ => self.write(writer),
        }
    }
}

/// A fully-decoded resource record: wire identity plus lifetime bookkeeping.
///
/// `created_at` and the stale/expired checks below are wall-clock concerns
/// the codec does not originate — callers stamp `created_at` when a record is
/// accepted into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub class: Class,
    pub unique: bool,
    pub ttl: u32,
    pub created_at: u64,
    pub data: RecordData,
}

impl Entry {
    pub fn new(name: impl Into<String>, ttl: u32, data: RecordData) -> Self {
        Self {
            name: name.into(),
            class: Class::In,
            unique: true,
            ttl,
            created_at: 0,
            data,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.data.record_type()
    }

    /// Two records are the same record for cache/known-answer purposes iff
    /// name (case-insensitively), type, class and payload all match.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.record_type() == other.record_type()
            && self.class == other.class
            && self.data == other.data
    }

    fn expiry_ms(&self) -> u64 {
        self.created_at + (self.ttl as u64) * 1000
    }

    pub fn is_stale(&self, now_ms: u64) -> bool {
        let half_life = self.created_at + (self.ttl as u64) * 500;
        now_ms >= half_life
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiry_ms()
    }

    pub fn reset_ttl(&mut self, now_ms: u64, ttl: u32) {
        self.created_at = now_ms;
        self.ttl = ttl;
    }

    /// Known-answer suppression: a record we'd otherwise send may be
    /// dropped if `other` already carries the same record with more than
    /// half our TTL remaining.
    pub fn suppressed_by(&self, other: &Self) -> bool {
        self.same_identity(other) && other.ttl as u64 * 2 > self.ttl as u64
    }

    /// Canonical wire form used for RFC 6762 section 9.2 tie-breaking:
    /// class, then type, then raw payload bytes, compared lexicographically.
    /// The numerically greater record wins a simultaneous probe.
    pub fn tiebreak_cmp(&self, other: &Self) -> Ordering {
        self.class
            .into_num()
            .cmp(&other.class.into_num())
            .then_with(|| self.record_type().into_num().cmp(&other.record_type().into_num()))
            .then_with(|| self.canonical_payload().cmp(&other.canonical_payload()))
    }

    fn canonical_payload(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new(usize::MAX);
        let _ = self.data.write(&mut writer);
        writer.finish().unwrap_or_default()
    }

    pub fn read(reader: &mut MessageReader<'_>, now_ms: u64) -> Result<Self, MalformedMessage> {
        let name = reader.read_name()?;
        let qtype = RecordType::from_num(reader.read_u16()?);
        let raw_class = reader.read_u16()?;
        let (class, unique) = split_class(raw_class);
        let ttl = reader.read_u32()?;
        let rdlength = reader.read_u16()? as usize;
        let data = RecordData::read(reader, qtype, raw_class, rdlength)?;

        Ok(Self {
            name,
            class,
            unique,
            ttl,
            created_at: now_ms,
            data,
        })
    }

    pub fn write(&self, writer: &mut MessageWriter) -> Result<(), WriterError> {
        self.write_as(writer, self.record_type())
    }

    /// Write this record as though it occupied a slot of `slot` type,
    /// applying address-family normalization if the stored payload and the
    /// slot type disagree.
    pub fn write_as(&self, writer: &mut MessageWriter, slot: RecordType) -> Result<(), WriterError> {
        writer.write_name(&self.name)?;
        writer.write_u16(slot.into_num())?;

        let class_raw = if let RecordData::Opt { udp_payload_size, .. } = self.data {
            udp_payload_size
        } else {
            join_class(self.class, self.unique)
        };
        writer.write_u16(class_raw)?;
        writer.write_u32(self.ttl)?;

        let rdlength_pos = writer.pos();
        writer.write_u16(0)?;
        let rdata_start = writer.pos();
        self.data.write_in_slot(writer, slot)?;
        let rdlength = writer.pos() - rdata_start;
        writer.set_u16(rdlength_pos, rdlength as u16);

        Ok(())
    }
}
