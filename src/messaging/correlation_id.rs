use std::fmt::{Debug, Display, Formatter};

/// A [CorrelationId] links a request packet to the response packet(s) answering it. Requesters
///  pick a fresh random id per request, and a response echoes the id of the request it answers.
///
/// Ids need to be unique only among requests that are outstanding at the same time, reusing an
///  id after its request completed is fine.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CorrelationId([u8; CorrelationId::LEN]);

impl CorrelationId {
    pub const LEN: usize = 32;

    pub fn random() -> CorrelationId {
        CorrelationId(rand::random())
    }

    pub const fn from_raw(raw: [u8; CorrelationId::LEN]) -> CorrelationId {
        CorrelationId(raw)
    }

    /// convenience for tests and diagnostics: an id that is all zeros except for the last byte
    pub const fn from_u8(value: u8) -> CorrelationId {
        let mut raw = [0u8; CorrelationId::LEN];
        raw[CorrelationId::LEN - 1] = value;
        CorrelationId(raw)
    }

    pub fn as_bytes(&self) -> &[u8; CorrelationId::LEN] {
        &self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // the first few bytes are plenty for telling ids apart in logs
        write!(f, "#")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..{:02x}", self.0[CorrelationId::LEN - 1])
    }
}
