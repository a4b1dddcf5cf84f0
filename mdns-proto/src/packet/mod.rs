pub mod question;
pub mod record;

pub use question::{Class, Question, RecordType};
pub use record::{Entry, RecordData};

use crate::buffer::{MalformedMessage, MessageReader, MessageWriter, WriterError};

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_TRUNCATED: u16 = 0x0200;

/// A DNS-formatted message: 12-byte header plus four record sections.
///
/// The truncation bit lets a query that did not fit in one datagram continue
/// into the next; [`Message::append`] joins such a continuation back onto the
/// message it extends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub response: bool,
    pub authoritative: bool,
    pub truncated: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Entry>,
    pub authorities: Vec<Entry>,
    pub additionals: Vec<Entry>,
}

impl Message {
    pub fn query() -> Self {
        Self::default()
    }

    pub fn response() -> Self {
        Self {
            response: true,
            authoritative: true,
            ..Self::default()
        }
    }

    pub fn read(data: &[u8], now_ms: u64) -> Result<Self, MalformedMessage> {
        let mut reader = MessageReader::new(data);

        let id = reader.read_u16()?;
        let flags = reader.read_u16()?;
        let qd_count = reader.read_u16()?;
        let an_count = reader.read_u16()?;
        let ns_count = reader.read_u16()?;
        let ar_count = reader.read_u16()?;

        let mut questions = Vec::with_capacity(qd_count as usize);
        for _ in 0..qd_count {
            questions.push(Question::read(&mut reader)?);
        }

        let mut answers = Vec::with_capacity(an_count as usize);
        for _ in 0..an_count {
            answers.push(Entry::read(&mut reader, now_ms)?);
        }

        let mut authorities = Vec::with_capacity(ns_count as usize);
        for _ in 0..ns_count {
            authorities.push(Entry::read(&mut reader, now_ms)?);
        }

        let mut additionals = Vec::with_capacity(ar_count as usize);
        for _ in 0..ar_count {
            additionals.push(Entry::read(&mut reader, now_ms)?);
        }

        Ok(Self {
            id,
            response: flags & FLAG_RESPONSE != 0,
            authoritative: flags & FLAG_AUTHORITATIVE != 0,
            truncated: flags & FLAG_TRUNCATED != 0,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    pub fn write(&self, max_payload: usize) -> Result<Vec<u8>, WriterError> {
        let mut writer = MessageWriter::new(max_payload);

        let mut flags = 0u16;
        if self.response {
            flags |= FLAG_RESPONSE;
        }
        if self.authoritative {
            flags |= FLAG_AUTHORITATIVE;
        }
        if self.truncated {
            flags |= FLAG_TRUNCATED;
        }

        writer.write_u16(self.id)?;
        writer.write_u16(flags)?;
        writer.write_u16(self.questions.len() as u16)?;
        writer.write_u16(self.answers.len() as u16)?;
        writer.write_u16(self.authorities.len() as u16)?;
        writer.write_u16(self.additionals.len() as u16)?;

        for question in &self.questions {
            question.write(&mut writer)?;
        }
        for entry in &self.answers {
            entry.write(&mut writer)?;
        }
        for entry in &self.authorities {
            entry.write(&mut writer)?;
        }
        for entry in &self.additionals {
            entry.write(&mut writer)?;
        }

        writer.finish()
    }

    /// Join a truncated-query continuation onto the message it continues.
    pub fn append(&mut self, mut other: Self) -> Result<(), MalformedMessage> {
        if self.response || other.response {
            return Err(MalformedMessage {
                offset: 0,
                reason: "cannot append a continuation to a non-query message",
            });
        }
        if !self.truncated {
            return Err(MalformedMessage {
                offset: 0,
                reason: "first message was not marked truncated",
            });
        }

        self.questions.append(&mut other.questions);
        self.answers.append(&mut other.answers);
        self.authorities.append(&mut other.authorities);
        self.additionals.append(&mut other.additionals);
        self.truncated = other.truncated;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn should_round_trip_empty_query() {
        let message = Message::query();
        let bytes = message.write(512).unwrap();
        let decoded = Message::read(&bytes, 0).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn should_round_trip_query_with_question() {
        let mut message = Message::query();
        message.questions.push(Question::new("_http._tcp.local", RecordType::Ptr));
        let bytes = message.write(512).unwrap();
        let decoded = Message::read(&bytes, 0).unwrap();
        assert_eq!(decoded.questions, message.questions);
    }

    #[test]
    fn should_round_trip_response_with_answer() {
        let mut message = Message::response();
        message.answers.push(Entry::new(
            "host.local",
            120,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))),
        ));
        let bytes = message.write(512).unwrap();
        let decoded = Message::read(&bytes, 1_000).unwrap();
        assert!(decoded.response);
        assert!(decoded.authoritative);
        assert_eq!(decoded.answers[0].data, message.answers[0].data);
        assert_eq!(decoded.answers[0].created_at, 1_000);
    }

    #[test]
    fn should_append_truncated_continuation() {
        let mut first = Message::query();
        first.truncated = true;
        first.questions.push(Question::new("a.local", RecordType::A));

        let mut second = Message::query();
        second.questions.push(Question::new("b.local", RecordType::A));

        first.append(second).unwrap();
        assert_eq!(first.questions.len(), 2);
        assert!(!first.truncated);
    }

    #[test]
    fn should_reject_append_onto_non_truncated_message() {
        let mut first = Message::query();
        let second = Message::query();
        let error = first.append(second).unwrap_err();
        assert_eq!(error.reason, "first message was not marked truncated");
    }

    #[test]
    fn should_reject_append_onto_response() {
        let mut first = Message::response();
        first.truncated = true;
        let second = Message::query();
        let error = first.append(second).unwrap_err();
        assert_eq!(error.reason, "cannot append a continuation to a non-query message");
    }
}
