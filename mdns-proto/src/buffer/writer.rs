use std::collections::HashMap;
use std::fmt;

use super::LABEL_MAX_LEN;

/// Raised when a message cannot be assembled: a label too long to encode, or
/// the finished payload would exceed the sender's negotiated ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterError {
    LabelTooLong,
    PayloadTooLarge { len: usize, max: usize },
}

impl fmt::Display for WriterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LabelTooLong => write!(f, "single label exceeds 63 bytes"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds payload ceiling of {max} bytes")
            }
        }
    }
}

impl std::error::Error for WriterError {}

/// Assembles a DNS-formatted message into an owned, growable buffer.
///
/// Domain name suffixes are remembered by byte offset so that a later name
/// sharing a suffix with one already written can be replaced with a
/// compression pointer instead of repeating the labels.
pub struct MessageWriter {
    buf: Vec<u8>,
    max_payload: usize,
    suffixes: HashMap<String, usize>,
}

impl MessageWriter {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_payload.min(4096)),
            max_payload,
            suffixes: HashMap::new(),
        }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    pub fn write_u8(&mut self, val: u8) -> Result<(), WriterError> {
        self.buf.push(val);
        Ok(())
    }

    pub fn write_u16(&mut self, val: u16) -> Result<(), WriterError> {
        self.write_u8((val >> 8) as u8)?;
        self.write_u8((val & 0xFF) as u8)
    }

    pub fn write_u32(&mut self, val: u32) -> Result<(), WriterError> {
        self.write_u8(((val >> 24) & 0xFF) as u8)?;
        self.write_u8(((val >> 16) & 0xFF) as u8)?;
        self.write_u8(((val >> 8) & 0xFF) as u8)?;
        self.write_u8((val & 0xFF) as u8)
    }

    pub fn write_bytes(&mut self, val: &[u8]) -> Result<(), WriterError> {
        self.buf.extend_from_slice(val);
        Ok(())
    }

    /// Overwrite a previously-written 16-bit field, e.g. to patch RDLENGTH
    /// once the record payload that follows it is known.
    pub fn set_u16(&mut self, pos: usize, val: u16) {
        self.buf[pos] = (val >> 8) as u8;
        self.buf[pos + 1] = (val & 0xFF) as u8;
    }

    fn write_label(&mut self, label: &str) -> Result<(), WriterError> {
        let bytes = label.as_bytes();
        if bytes.len() > LABEL_MAX_LEN as usize {
            return Err(WriterError::LabelTooLong);
        }
        self.write_u8(bytes.len() as u8)?;
        self.write_bytes(bytes)
    }

    fn recursive_write_name(&mut self, name: &str, compress: bool) -> Result<bool, WriterError> {
        if name.is_empty() {
            return Ok(false);
        }
        if compress {
            if let Some(&offset) = self.suffixes.get(name) {
                self.write_u16(0xC000 | offset as u16)?;
                return Ok(true);
            }
            self.suffixes.insert(name.to_string(), self.pos());
        }

        match name.split_once('.') {
            Some((head, tail)) => {
                self.write_label(head)?;
                self.recursive_write_name(tail, compress)
            }
            None => {
                self.write_label(name)?;
                Ok(false)
            }
        }
    }

    /// Write a domain name, replacing any suffix seen earlier in this message
    /// with a compression pointer.
    pub fn write_name(&mut self, name: &str) -> Result<(), WriterError> {
        if !self.recursive_write_name(name, true)? {
            self.write_u8(0)?;
        }
        Ok(())
    }

    /// Write a domain name without ever emitting or following a compression
    /// pointer, for the record types that require the receiver to decode it
    /// independent of message layout.
    pub fn write_name_raw(&mut self, name: &str) -> Result<(), WriterError> {
        if !self.recursive_write_name(name, false)? {
            self.write_u8(0)?;
        }
        Ok(())
    }

    /// Consume the writer, checking the assembled payload against the
    /// negotiated size ceiling.
    pub fn finish(self) -> Result<Vec<u8>, WriterError> {
        if self.buf.len() > self.max_payload {
            return Err(WriterError::PayloadTooLarge {
                len: self.buf.len(),
                max: self.max_payload,
            });
        }
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::MessageWriter;

    #[test]
    fn should_write_empty_name() {
        let mut writer = MessageWriter::new(512);
        writer.write_name("").unwrap();
        assert_eq!(writer.finish().unwrap(), vec![0]);
    }

    #[test]
    fn should_write_simple_name() {
        let mut writer = MessageWriter::new(512);
        writer.write_name("www.foo.bar").unwrap();
        let buf = writer.finish().unwrap();
        assert_eq!(
            buf,
            vec![3, b'w', b'w', b'w', 3, b'f', b'o', b'o', 3, b'b', b'a', b'r', 0]
        );
    }

    #[test]
    fn should_compress_shared_suffix() {
        let mut writer = MessageWriter::new(512);
        writer.write_name("www.foo.bar").unwrap();
        writer.write_name("what.foo.bar").unwrap();
        let buf = writer.finish().unwrap();
        assert_eq!(buf[13], 4);
        assert_eq!(&buf[14..18], b"what");
        assert_eq!(buf[18], 0xC0);
        assert_eq!(buf[19], 0x04);
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn should_not_compress_raw_name() {
        let mut writer = MessageWriter::new(512);
        writer.write_name("foo.bar").unwrap();
        writer.write_name_raw("foo.bar").unwrap();
        let buf = writer.finish().unwrap();
        // second occurrence repeats the labels instead of pointing back.
        assert_eq!(buf.len(), 9 + 9);
    }

    #[test]
    fn should_reject_oversized_label() {
        let mut writer = MessageWriter::new(512);
        let label = "a".repeat(64);
        let error = writer.write_name(&label).unwrap_err();
        assert_eq!(error, super::WriterError::LabelTooLong);
    }

    #[test]
    fn should_reject_payload_over_ceiling() {
        let mut writer = MessageWriter::new(4);
        writer.write_u32(1).unwrap();
        writer.write_u8(1).unwrap();
        let error = writer.finish().unwrap_err();
        assert!(matches!(error, super::WriterError::PayloadTooLarge { len: 5, max: 4 }));
    }

    #[test]
    fn should_patch_u16_field() {
        let mut writer = MessageWriter::new(512);
        writer.write_u16(0).unwrap();
        writer.write_u8(0xAB).unwrap();
        writer.set_u16(0, 42);
        let buf = writer.finish().unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 42);
    }
}
