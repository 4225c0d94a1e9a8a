use crate::messaging::peer_addr::PeerAddr;

const TEST_PEER_ADDR_LEN: usize = 32;

/// a deterministic peer address that is distinct for every number
pub fn test_peer_addr(number: u16) -> PeerAddr {
    let mut raw = vec![0xaa; TEST_PEER_ADDR_LEN];
    raw[..2].copy_from_slice(&number.to_be_bytes());
    PeerAddr::new(raw)
}
