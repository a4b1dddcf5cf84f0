use std::fmt;

use super::{LABEL_COMPRESSED, LABEL_LENGTH_MASK, LABEL_MAX_LEN};

/// An unrecoverable parse failure of a whole message: a bad name pointer, a
/// truncated payload, or an unknown label type. The reader that raises this
/// drops the message and continues with the next datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage {
    pub offset: usize,
    pub reason: &'static str,
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed message at offset {}: {}", self.offset, self.reason)
    }
}

impl std::error::Error for MalformedMessage {}

impl MalformedMessage {
    fn at(offset: usize, reason: &'static str) -> Self {
        Self { offset, reason }
    }
}

/// Reads a DNS-formatted message out of a borrowed datagram.
///
/// Tracks label positions visited while decoding a single name so that
/// compression pointers can be rejected if they do not strictly decrease —
/// the only loop-proof rule for a name built from back-references.
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn byte_at(&self, pos: usize) -> Result<u8, MalformedMessage> {
        self.data
            .get(pos)
            .copied()
            .ok_or_else(|| MalformedMessage::at(pos, "end of buffer"))
    }

    /// Step the read position forward without interpreting the skipped bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), MalformedMessage> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(MalformedMessage::at(self.pos, "end of buffer"));
        }
        self.pos = end;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, MalformedMessage> {
        let value = self.byte_at(self.pos)?;
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, MalformedMessage> {
        let hi = self.read_u8()? as u16;
        let lo = self.read_u8()? as u16;
        Ok((hi << 8) | lo)
    }

    pub fn read_u32(&mut self) -> Result<u32, MalformedMessage> {
        let a = self.read_u8()? as u32;
        let b = self.read_u8()? as u32;
        let c = self.read_u8()? as u32;
        let d = self.read_u8()? as u32;
        Ok((a << 24) | (b << 16) | (c << 8) | d)
    }

    /// Borrow `len` bytes starting at the current position and advance past them.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], MalformedMessage> {
        let start = self.pos;
        let end = start + len;
        if end > self.data.len() {
            return Err(MalformedMessage::at(start, "end of buffer"));
        }
        self.pos = end;
        Ok(&self.data[start..end])
    }

    /// Read a domain name, following compression pointers as needed.
    ///
    /// `first` tracks the lowest offset visited since the name started; any
    /// pointer whose target is not strictly less than `first` is rejected,
    /// which rules out both self-loops and forward jumps. After a jump the
    /// caller's read position resumes at the byte following the pointer, not
    /// at the jumped-to region.
    pub fn read_name(&mut self) -> Result<String, MalformedMessage> {
        let start = self.pos;
        let (name, next) = self.read_name_at(start)?;
        self.pos = next;
        Ok(name)
    }

    fn read_name_at(&self, start: usize) -> Result<(String, usize), MalformedMessage> {
        let mut labels: Vec<String> = Vec::new();
        let mut cursor = start;
        let mut first = start;
        let mut jumped = false;
        let mut resume_at = start;

        loop {
            first = first.min(cursor);
            let len = self.byte_at(cursor)?;

            match len & LABEL_LENGTH_MASK {
                0x00 => {
                    if len == 0 {
                        cursor += 1;
                        if !jumped {
                            resume_at = cursor;
                        }
                        break;
                    }

                    let label_len = (len & !LABEL_LENGTH_MASK) as usize;
                    let bytes = self.read_range(cursor + 1, label_len)?;
                    labels.push(String::from_utf8_lossy(bytes).to_ascii_lowercase());
                    cursor += 1 + label_len;
                    if !jumped {
                        resume_at = cursor;
                    }
                }
                LABEL_COMPRESSED => {
                    let lo = self.byte_at(cursor + 1)? as u16;
                    let pointer = (((len as u16) & !(LABEL_LENGTH_MASK as u16) & 0xFF) << 8) | lo;
                    let pointer = pointer as usize;

                    if !jumped {
                        resume_at = cursor + 2;
                    }
                    if pointer >= first {
                        return Err(MalformedMessage::at(cursor, "compression pointer does not decrease"));
                    }

                    jumped = true;
                    cursor = pointer;
                    continue;
                }
                _ => return Err(MalformedMessage::at(cursor, "unsupported label type")),
            }
        }

        let _ = LABEL_MAX_LEN;
        Ok((labels.join("."), resume_at))
    }

    fn read_range(&self, start: usize, len: usize) -> Result<&'a [u8], MalformedMessage> {
        let end = start + len;
        if end > self.data.len() {
            return Err(MalformedMessage::at(start, "end of buffer"));
        }
        Ok(&self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::MessageReader;

    #[test]
    fn should_read_empty_name() {
        let buf = [0u8];
        let mut reader = MessageReader::new(&buf);
        let result = reader.read_name().unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn should_read_simple_name() {
        let buf = [2, b'a', b'b', 0];
        let mut reader = MessageReader::new(&buf);
        let result = reader.read_name().unwrap();
        assert_eq!(result, "ab");
    }

    #[test]
    fn should_read_multiple_label_name() {
        let buf = [2, b'a', b'b', 1, b'c', 1, b'd', 0];
        let mut reader = MessageReader::new(&buf);
        let result = reader.read_name().unwrap();
        assert_eq!(result, "ab.c.d");
    }

    #[test]
    fn should_lowercase_labels() {
        let buf = [2, b'A', b'B', 0];
        let mut reader = MessageReader::new(&buf);
        let result = reader.read_name().unwrap();
        assert_eq!(result, "ab");
    }

    #[test]
    fn should_reject_self_referencing_pointer() {
        let buf = [0xC0, 0x00];
        let mut reader = MessageReader::new(&buf);
        let error = reader.read_name().unwrap_err();
        assert_eq!(error.reason, "compression pointer does not decrease");
    }

    #[test]
    fn should_reject_non_decreasing_pointer_chain() {
        // Name at offset 0 points to offset 2, which points back to offset 0.
        let buf = [0xC0, 0x02, 0xC0, 0x00];
        let mut reader = MessageReader::new(&buf);
        let error = reader.read_name().unwrap_err();
        assert_eq!(error.reason, "compression pointer does not decrease");
    }

    #[test]
    fn should_follow_decreasing_pointer_chain() {
        // offset 0: "b" then root; offset 3: "c" "d" then root; offset 8: "a" pointing at offset 3.
        let buf = [1, b'b', 0, 1, b'c', 1, b'd', 0, 1, b'a', 0xC0, 3];
        let mut reader = MessageReader::new(&buf);
        reader.skip(8).unwrap();
        let result = reader.read_name().unwrap();
        assert_eq!(result, "a.c.d");
        assert_eq!(reader.pos(), 12);
    }

    #[test]
    fn should_resume_after_pointer_not_at_target() {
        let buf = [1, b'x', 0, 1, b'y', 0xC0, 0x00];
        let mut reader = MessageReader::new(&buf);
        reader.skip(3).unwrap();
        let result = reader.read_name().unwrap();
        assert_eq!(result, "y.x");
        assert_eq!(reader.pos(), 7);
    }

    #[test]
    fn should_fail_on_extended_label_type() {
        let buf = [0x40, 0x00];
        let mut reader = MessageReader::new(&buf);
        let error = reader.read_name().unwrap_err();
        assert_eq!(error.reason, "unsupported label type");
    }

    #[test]
    fn should_read_integers() {
        let buf = [0x01, 0x02, 0x00, 0x00, 0x00, 0x03];
        let mut reader = MessageReader::new(&buf);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u32().unwrap(), 0x03);
    }
}
