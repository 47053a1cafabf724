//! Frame encoder/decoder: per-message transfer encoding and
//! whitespace-delimited field parsing.
use crate::error::CodecError;

const ESCAPE: u8 = 0x5C;
const ESCAPED_ESCAPE: u8 = 0x2F;
const ESCAPED_NEWLINE: u8 = 0x6E;
const FIELD_SEP: u8 = b' ';
const TERMINATOR: u8 = b'\n';

/// A growable byte sequence with an independent read cursor.
///
/// Used both as a builder, when composing an outgoing message with the
/// `write_*` methods, and as a parser, when wrapping an already-decoded
/// received frame with [`MessageBuffer::from_frame`] and reading it back
/// with the `read_*` methods.
///
/// The read cursor can exceed `data.len()` by exactly one: that is the
/// internal "nothing left, not even an empty trailing field" sentinel,
/// distinct from `cursor == data.len()`, which means "a delimiter was
/// just consumed and one more (possibly empty) field follows".
#[derive(Debug, Clone, Default)]
pub struct MessageBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl MessageBuffer {
    /// Start building an outgoing message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already-framed (0x0A-stripped) received message, applying
    /// the transfer-encoding substitutions in reverse.
    ///
    /// A `\` not followed by `/` or `n` is dropped along with whatever
    /// follows it (including a `\` with nothing following at all) — this
    /// mirrors the original client's behavior, whether or not it was
    /// intentional.
    pub fn from_frame(frame: &[u8]) -> Self {
        let mut data = Vec::with_capacity(frame.len());
        let mut i = 0;

        while i < frame.len() {
            match frame[i] {
                ESCAPE => match frame.get(i + 1) {
                    Some(&ESCAPED_ESCAPE) => {
                        data.push(ESCAPE);
                        i += 2;
                    }
                    Some(&ESCAPED_NEWLINE) => {
                        data.push(TERMINATOR);
                        i += 2;
                    }
                    Some(_) => i += 2,
                    None => i += 1,
                },
                b => {
                    data.push(b);
                    i += 1;
                }
            }
        }

        Self { data, cursor: 0 }
    }

    /// Encode the buffer's current contents for sending: apply the
    /// transfer-encoding substitutions and append the single terminator.
    pub fn encode_for_sending(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 1);

        for &b in &self.data {
            match b {
                ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
                TERMINATOR => out.extend_from_slice(&[ESCAPE, ESCAPED_NEWLINE]),
                b => out.push(b),
            }
        }
        out.push(TERMINATOR);
        out
    }

    /// Self-separating field write: prepends a single space iff the
    /// buffer is already non-empty.
    fn write_field(&mut self, bytes: &[u8]) {
        if !self.data.is_empty() {
            self.data.push(FIELD_SEP);
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_field(s.as_bytes());
        self
    }

    pub fn write_decimal(&mut self, n: impl std::fmt::Display) -> &mut Self {
        self.write_field(n.to_string().as_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_field(bytes);
        self
    }

    /// Read the next whitespace-delimited field as raw bytes, advancing
    /// the cursor past the delimiter. Yields an empty sequence if two
    /// delimiters are adjacent.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        if self.cursor > self.data.len() {
            return Err(CodecError::EndOfInput);
        }

        let start = self.cursor;
        let rest = &self.data[start..];
        let delim = rest.iter().position(|&b| b == FIELD_SEP);

        let (end, next_cursor) = match delim {
            Some(offset) => (start + offset, start + offset + 1),
            None => (self.data.len(), self.data.len() + 1),
        };

        let field = self.data[start..end].to_vec();
        self.cursor = next_cursor;

        Ok(field)
    }

    /// Read the next field as a UTF-8 string, normalizing CRLF/CR to LF
    /// and trimming leading/trailing whitespace.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        let raw = String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");

        Ok(normalized.trim().to_owned())
    }

    /// Consume and return everything from the cursor to the end of the
    /// buffer, without splitting on further delimiters.
    pub fn read_bytes_until_end(&mut self) -> Vec<u8> {
        if self.cursor > self.data.len() {
            return Vec::new();
        }
        let rest = self.data[self.cursor..].to_vec();
        self.cursor = self.data.len() + 1;
        rest
    }

    /// Reset the cursor and read the first field as the command token.
    /// Fails with "end of input" if the message is empty.
    pub fn read_command(&mut self) -> Result<String, CodecError> {
        self.cursor = 0;
        let bytes = self.read_bytes()?;
        if bytes.is_empty() {
            return Err(CodecError::EndOfInput);
        }
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }
}
