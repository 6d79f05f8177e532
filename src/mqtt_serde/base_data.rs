use bytes::BufMut;

use crate::mqtt_serde::parser::ParseError;

/// Largest value the remaining length field can carry (four bytes of seven bits).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

pub struct TwoByteInteger;

impl TwoByteInteger {
    pub fn encode(val: u16) -> [u8; 2] {
        val.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<(u16, usize), ParseError> {
        if bytes.len() < 2 {
            return Err(ParseError::BufferTooShort);
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), 2))
    }
}

/// The MQTT "remaining length" encoding: seven data bits per byte, least significant
/// group first, bit 7 set while more bytes follow.
pub struct VariableByteInteger;

impl VariableByteInteger {
    /// Number of bytes `val` occupies on the wire, or 0 if it cannot be encoded.
    pub fn encode_length_in_bytes(val: usize) -> usize {
        match val {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            2_097_152..=MAX_REMAINING_LENGTH => 4,
            _ => 0,
        }
    }

    /// Writes `val` into `out` and returns the number of bytes written.
    ///
    /// Values above [`MAX_REMAINING_LENGTH`] write nothing and return 0; callers size
    /// their buffers with [`encode_length_in_bytes`](Self::encode_length_in_bytes)
    /// first and reject such values there.
    pub fn encode<B: BufMut>(val: usize, out: &mut B) -> usize {
        if val > MAX_REMAINING_LENGTH {
            return 0;
        }
        let mut num = val;
        let mut written = 0;
        loop {
            let mut byte = (num % 128) as u8;
            num /= 128;
            if num > 0 {
                byte |= 128;
            }
            out.put_u8(byte);
            written += 1;
            if num == 0 {
                break;
            }
        }
        written
    }

    /// Decodes a remaining length from the start of `buffer`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
        if buffer.is_empty() {
            return Err(ParseError::BufferTooShort);
        }

        let mut multiplier = 1;
        let mut value = 0;
        let mut i: usize = 0;
        loop {
            let byte = *buffer.get(i).ok_or(ParseError::More(
                1,
                "vbi: not enough bytes for remaining length".to_string(),
            ))?;

            if byte & 128 != 0 && i == 3 {
                // a fifth byte would be needed
                return Err(ParseError::InvalidVariableByteInteger);
            }

            value += (byte & 127) as usize * multiplier;
            multiplier *= 128;
            i += 1;
            if byte & 128 == 0 {
                break;
            }
        }
        Ok((value, i))
    }
}

pub struct BinaryData;

impl BinaryData {
    /// Length-prefixed byte string. `data` must not exceed 65535 bytes.
    pub fn encode<B: BufMut>(data: &[u8], out: &mut B) {
        out.put_u16(data.len() as u16);
        out.put_slice(data);
    }

    /// Wire size of a length-prefixed byte string.
    pub fn encoded_len(data: &[u8]) -> usize {
        2 + data.len()
    }
}

pub struct Utf8String;

impl Utf8String {
    pub fn encode<B: BufMut>(s: &str, out: &mut B) {
        BinaryData::encode(s.as_bytes(), out)
    }

    pub fn decode(bytes: &[u8]) -> Result<String, ParseError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(ParseError::Utf8Error)
    }
}
