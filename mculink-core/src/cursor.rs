//! Bounds-checked read cursor over a byte slice

use crate::error::FrameError;

/// Sequential reader that never indexes past the end of its slice
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Start reading at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything read so far
    pub fn consumed(&self) -> &'a [u8] {
        &self.data[..self.pos]
    }

    /// Take the next `n` bytes
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos.checked_add(n).ok_or(FrameError::Truncated {
            needed: usize::MAX,
            available: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(FrameError::Truncated {
                needed: end,
                available: self.data.len(),
            });
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Take one byte
    pub fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian unsigned integer `width` bytes wide (0..=4)
    pub fn be_uint(&mut self, width: usize) -> Result<u32, FrameError> {
        let bytes = self.take(width)?;
        Ok(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_within_bounds() {
        let mut c = ByteCursor::new(&[1, 2, 3, 4]);
        assert_eq!(c.u8().unwrap(), 1);
        assert_eq!(c.take(2).unwrap(), &[2, 3]);
        assert_eq!(c.remaining(), 1);
        assert_eq!(c.consumed(), &[1, 2, 3]);
    }

    #[test]
    fn test_take_past_end_reports_needed() {
        let mut c = ByteCursor::new(&[1, 2]);
        c.u8().unwrap();
        let err = c.take(4).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                needed: 5,
                available: 2
            }
        );
        // Failed read does not move the cursor
        assert_eq!(c.position(), 1);
    }

    #[test]
    fn test_be_uint_widths() {
        let data = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(ByteCursor::new(&data).be_uint(0).unwrap(), 0);
        assert_eq!(ByteCursor::new(&data).be_uint(1).unwrap(), 0x12);
        assert_eq!(ByteCursor::new(&data).be_uint(2).unwrap(), 0x1234);
        assert_eq!(ByteCursor::new(&data).be_uint(4).unwrap(), 0x1234_5678);
    }
}
