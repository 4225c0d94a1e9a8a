use std::fmt::{Debug, Formatter};

use bytes::Bytes;

/// A [PeerAddr] identifies a remote participant of the overlay network. It wraps the raw
///  destination bytes the transport works with, and it is opaque to this crate: it is only ever
///  compared, hashed, cloned and handed back to the transport.
///
/// NB: Destinations of anonymous overlay networks are typically several hundred bytes long, so
///      the raw bytes are kept in a ref-counted [Bytes] buffer to keep cloning cheap.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddr(Bytes);

impl PeerAddr {
    const DEBUG_PREFIX_LEN: usize = 8;

    pub fn new(raw: impl Into<Bytes>) -> PeerAddr {
        PeerAddr(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for b in self.0.iter().take(Self::DEBUG_PREFIX_LEN) {
            write!(f, "{:02x}", b)?;
        }
        if self.0.len() > Self::DEBUG_PREFIX_LEN {
            write!(f, "..")?;
        }
        write!(f, "]")
    }
}

impl From<&[u8]> for PeerAddr {
    fn from(value: &[u8]) -> Self {
        PeerAddr(Bytes::copy_from_slice(value))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty(b"", "[]")]
    #[case::short(b"\x01\xab", "[01ab]")]
    #[case::exactly_prefix(b"\x00\x01\x02\x03\x04\x05\x06\x07", "[0001020304050607]")]
    #[case::long(b"\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09", "[0001020304050607..]")]
    fn test_debug(#[case] raw: &[u8], #[case] expected: &str) {
        let addr = PeerAddr::from(raw);
        assert_eq!(format!("{:?}", addr), expected);
    }

    #[test]
    fn test_eq_is_by_content() {
        let a = PeerAddr::new(vec![1u8, 2, 3]);
        let b = PeerAddr::from(&[1u8, 2, 3][..]);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), &[1, 2, 3]);
        assert_ne!(a, PeerAddr::new(vec![1u8, 2]));
    }
}
