//! Payload text conversion
//!
//! Requests carry a numeric `base` and an `encoding` separator pattern. Base 0
//! (or 256) sends the bytes untouched. Bases 2, 8, 10 and 16 treat the payload
//! as text: it is split on any of the separator characters (whitespace when
//! the pattern is empty) and every token is parsed in that base into one byte.

use crate::error::FrameError;

/// Raw pass-through base
pub const BASE_RAW: u32 = 0;

/// How a payload is turned into wire bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PayloadEncoding {
    /// Numeric base, or 0 for raw bytes
    pub base: u32,
    /// Separator characters between tokens
    pub separators: String,
}

impl PayloadEncoding {
    /// Raw bytes
    pub fn raw() -> Self {
        Self::default()
    }

    /// Text tokens in `base`, separated by any of `separators`
    pub fn text(base: u32, separators: impl Into<String>) -> Self {
        Self {
            base,
            separators: separators.into(),
        }
    }

    /// True when payloads pass through unchanged
    pub fn is_raw(&self) -> bool {
        self.base == BASE_RAW || self.base == 256
    }

    /// Reject bases the converter does not understand
    pub fn validate(&self) -> Result<(), FrameError> {
        match self.base {
            0 | 2 | 8 | 10 | 16 | 256 => Ok(()),
            b => Err(FrameError::InvalidPayload(format!("unsupported base {}", b))),
        }
    }

    fn is_separator(&self, c: char) -> bool {
        if self.separators.is_empty() {
            c.is_whitespace()
        } else {
            self.separators.contains(c) || c == '\n' || c == '\r'
        }
    }

    /// Convert a complete payload
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        self.validate()?;
        if self.is_raw() {
            return Ok(data.to_vec());
        }
        let text = std::str::from_utf8(data)
            .map_err(|e| FrameError::InvalidPayload(format!("payload is not text: {}", e)))?;
        text.split(|c| self.is_separator(c))
            .filter(|t| !t.is_empty())
            .map(|t| self.parse_token(t))
            .collect()
    }

    fn parse_token(&self, token: &str) -> Result<u8, FrameError> {
        let digits = match self.base {
            16 => token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token),
            2 => token.strip_prefix("0b").unwrap_or(token),
            _ => token,
        };
        u8::from_str_radix(digits, self.base).map_err(|e| {
            FrameError::InvalidPayload(format!(
                "token '{}' is not a base-{} byte: {}",
                token, self.base, e
            ))
        })
    }
}

/// Streaming converter for file sends.
///
/// Disk chunks can split a token; the unfinished tail is held back until the
/// next chunk (or [`finish`](Self::finish)) completes it.
#[derive(Debug, Clone)]
pub struct PayloadStream {
    encoding: PayloadEncoding,
    carry: Vec<u8>,
}

impl PayloadStream {
    /// Start a stream
    pub fn new(encoding: PayloadEncoding) -> Result<Self, FrameError> {
        encoding.validate()?;
        Ok(Self {
            encoding,
            carry: Vec::new(),
        })
    }

    /// Convert the next disk chunk
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, FrameError> {
        if self.encoding.is_raw() {
            return Ok(chunk.to_vec());
        }
        self.carry.extend_from_slice(chunk);
        // Only bytes up to the last separator are complete
        let cut = self
            .carry
            .iter()
            .rposition(|&b| (b as char).is_ascii() && self.encoding.is_separator(b as char))
            .map(|p| p + 1)
            .unwrap_or(0);
        let ready: Vec<u8> = self.carry.drain(..cut).collect();
        self.encoding.encode(&ready)
    }

    /// Convert whatever is left
    pub fn finish(&mut self) -> Result<Vec<u8>, FrameError> {
        if self.encoding.is_raw() {
            return Ok(Vec::new());
        }
        let rest = std::mem::take(&mut self.carry);
        self.encoding.encode(&rest)
    }
}
