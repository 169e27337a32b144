use crate::listener::AcceptedAddr;

/// Transport-level peer address, set when the connection is accepted.
#[derive(Debug, Clone)]
pub struct PeerAddr(pub AcceptedAddr);

/// Effective client address, resolved from the configured
/// `client_address_sources` (forwarded headers, proxy protocol, or peer).
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub AcceptedAddr);

impl From<AcceptedAddr> for PeerAddr {
    fn from(value: AcceptedAddr) -> Self {
        Self(value)
    }
}

impl From<AcceptedAddr> for RemoteAddr {
    fn from(value: AcceptedAddr) -> Self {
        Self(value)
    }
}
