//! Record Visitors
//!
//! Callers that only need part of a payload (a version field, a few leading
//! bytes) scan it through a visitor instead of loading the whole record.

use std::io::{self, Read};

/// Consumes a decoded payload as a stream
///
/// Implemented for any `FnMut(&mut dyn Read) -> io::Result<()>` closure.
pub trait RecordVisitor: Send + 'static {
    fn visit(&mut self, payload: &mut dyn Read) -> io::Result<()>;
}

impl<F> RecordVisitor for F
where
    F: FnMut(&mut dyn Read) -> io::Result<()> + Send + 'static,
{
    fn visit(&mut self, payload: &mut dyn Read) -> io::Result<()> {
        self(payload)
    }
}

/// Captures the first `limit` bytes of a payload and stops decoding there
#[derive(Debug, Clone)]
pub struct PrefixProbe {
    limit: usize,
    bytes: Vec<u8>,
}

impl PrefixProbe {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            bytes: Vec::with_capacity(limit),
        }
    }

    /// Bytes captured by the last visit (fewer than `limit` if the payload
    /// was shorter)
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl RecordVisitor for PrefixProbe {
    fn visit(&mut self, payload: &mut dyn Read) -> io::Result<()> {
        self.bytes.clear();
        payload.take(self.limit as u64).read_to_end(&mut self.bytes)?;
        Ok(())
    }
}
