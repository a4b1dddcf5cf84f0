pub mod reader;
pub mod writer;

pub use reader::{MalformedMessage, MessageReader};
pub use writer::{MessageWriter, WriterError};

/// Sender UDP payload size floor, per RFC 6762 section 17.
pub const MIN_PAYLOAD_SIZE: usize = 512;
/// Default sender UDP payload size absent any OPT record negotiation.
pub const DEFAULT_PAYLOAD_SIZE: usize = 1460;
/// Upper bound this codec is willing to assemble a single outgoing message into.
pub const MAX_PAYLOAD_SIZE: usize = 9000;

/// Two high bits of a DNS label length byte identify what kind of label follows.
pub(crate) const LABEL_COMPRESSED: u8 = 0xC0;
pub(crate) const LABEL_LENGTH_MASK: u8 = 0xC0;
pub(crate) const LABEL_MAX_LEN: u8 = 0x3F;
