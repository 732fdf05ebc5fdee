//! Payload compression.
//!
//! Only `none` ships built in; the trait keeps the codec ready for
//! delayed compression schemes.

use bytes::Bytes;
use fjord_platform::FjordResult;

/// Compression instance for one direction.
pub trait Compression: Send {
    /// Negotiated name.
    fn name(&self) -> &'static str;

    /// Compresses an outgoing payload.
    fn compress(&mut self, payload: Bytes) -> FjordResult<Bytes>;

    /// Decompresses an incoming payload.
    fn decompress(&mut self, payload: Bytes) -> FjordResult<Bytes>;
}

/// Built-in compression catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// Identity
    None,
}

impl CompressionAlgorithm {
    /// Default preference order.
    pub const ALL: [CompressionAlgorithm; 1] = [CompressionAlgorithm::None];

    /// Returns the algorithm name.
    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
        }
    }

    /// Parses compression algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }

    /// Creates an instance.
    pub fn create(self) -> Box<dyn Compression> {
        match self {
            CompressionAlgorithm::None => Box::new(NoCompression),
        }
    }
}

#[derive(Debug, Default)]
struct NoCompression;

impl Compression for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&mut self, payload: Bytes) -> FjordResult<Bytes> {
        Ok(payload)
    }

    fn decompress(&mut self, payload: Bytes) -> FjordResult<Bytes> {
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_identity() {
        let mut c = CompressionAlgorithm::from_name("none").unwrap().create();
        let data = Bytes::from_static(b"payload");
        assert_eq!(c.compress(data.clone()).unwrap(), data);
        assert_eq!(c.decompress(data.clone()).unwrap(), data);
        assert_eq!(CompressionAlgorithm::from_name("zlib"), None);
    }
}
