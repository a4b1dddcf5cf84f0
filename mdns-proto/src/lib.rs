pub mod buffer;
pub mod packet;

pub use buffer::{MalformedMessage, MessageReader, MessageWriter, WriterError};
pub use packet::{Class, Entry, Message, Question, RecordData, RecordType};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn fixture_ptr_query(id: u16, name: &str, service_type: &str) -> Vec<u8> {
        let mut message = Message::query();
        message.id = id;
        message.questions.push(Question::new(service_type, RecordType::Ptr));
        message.answers.push(Entry::new(name, 4500, RecordData::Pointer(name.into())));
        message.write(1460).unwrap()
    }

    #[test]
    fn should_decode_a_hand_built_ptr_query() {
        let bytes = fixture_ptr_query(42, "printer._http._tcp.local", "_http._tcp.local");
        let decoded = Message::read(&bytes, 0).unwrap();
        assert_eq!(decoded.id, 42);
        assert!(!decoded.response);
        assert_eq!(decoded.questions[0].name, "_http._tcp.local");
        assert_eq!(decoded.questions[0].qtype, RecordType::Ptr);
        assert_eq!(
            decoded.answers[0].data,
            RecordData::Pointer("printer._http._tcp.local".into())
        );
    }

    #[test]
    fn should_decode_a_hand_built_a_response() {
        let mut message = Message::response();
        message.id = 7;
        message.answers.push(Entry::new(
            "host.local",
            120,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 42))),
        ));
        let bytes = message.write(1460).unwrap();

        let decoded = Message::read(&bytes, 0).unwrap();
        assert!(decoded.response);
        assert!(decoded.authoritative);
        assert_eq!(decoded.answers.len(), 1);
        assert_eq!(
            decoded.answers[0].data,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 42)))
        );
    }

    #[test]
    fn should_reject_message_with_bad_compression_pointer() {
        let bytes = [0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0xC0, 0x0C, 0, 1, 0, 1];
        let error = Message::read(&bytes, 0).unwrap_err();
        assert_eq!(error.reason, "compression pointer does not decrease");
    }
}
