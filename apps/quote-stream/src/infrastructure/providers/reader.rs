//! Bounds-checked cursor over a binary frame.

use super::CodecError;

/// Sequential little-endian reader that never reads past the end of its
/// buffer.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    /// Create a reader positioned at the start of `buf`.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Check if every byte has been consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset into the frame.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Take the next `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(CodecError::Truncated {
                field,
                needed: len,
                remaining,
            });
        }

        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read exactly `N` bytes into an array.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if fewer than `N` bytes remain.
    pub fn read_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], CodecError> {
        let bytes = self.read_bytes(field, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] at end of frame.
    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>(field)?[0])
    }

    /// Read a little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if fewer than 2 bytes remain.
    pub fn read_u16_le(&mut self, field: &'static str) -> Result<u16, CodecError> {
        self.read_array(field).map(u16::from_le_bytes)
    }

    /// Read a little-endian `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if fewer than 4 bytes remain.
    pub fn read_f32_le(&mut self, field: &'static str) -> Result<f32, CodecError> {
        self.read_array(field).map(f32::from_le_bytes)
    }

    /// Read a little-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if fewer than 8 bytes remain.
    pub fn read_i64_le(&mut self, field: &'static str) -> Result<i64, CodecError> {
        self.read_array(field).map(i64::from_le_bytes)
    }

    /// Read a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if fewer than 8 bytes remain.
    pub fn read_u64_le(&mut self, field: &'static str) -> Result<u64, CodecError> {
        self.read_array(field).map(u64::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_values_in_order() {
        let mut buf = vec![0x07];
        buf.extend_from_slice(&0x0102_u16.to_le_bytes());
        buf.extend_from_slice(&1.5_f32.to_le_bytes());
        buf.extend_from_slice(&(-3_i64).to_le_bytes());

        let mut reader = FrameReader::new(&buf);

        assert_eq!(reader.read_u8("a").unwrap(), 0x07);
        assert_eq!(reader.read_u16_le("b").unwrap(), 0x0102);
        assert_eq!(reader.read_f32_le("c").unwrap(), 1.5);
        assert_eq!(reader.read_i64_le("d").unwrap(), -3);
        assert!(reader.is_empty());
    }

    #[test]
    fn short_read_reports_field_and_sizes() {
        let mut reader = FrameReader::new(&[1, 2, 3]);
        reader.read_u8("tag").unwrap();

        let err = reader.read_f32_le("price").unwrap_err();

        assert!(matches!(
            err,
            CodecError::Truncated {
                field: "price",
                needed: 4,
                remaining: 2
            }
        ));
        // A failed read does not advance the cursor
        assert_eq!(reader.position(), 1);
    }

    #[test]
    fn read_past_end_of_empty_buffer() {
        let mut reader = FrameReader::new(&[]);
        assert!(reader.read_u8("tag").is_err());
        assert!(reader.read_bytes("symbol", 0).unwrap().is_empty());
    }
}
