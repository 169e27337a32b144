use estuary_core::context::{PeerAddr, RemoteAddr};

// This struct should be an app-defined struct.
// The framework should not bind it.
certain_map::certain_map! {
    #[style = "unfilled"]
    #[derive(Debug, Clone)]
    #[empty(EmptyContext)]
    #[full(FullContext)]
    pub struct Context {
        // Set by ContextService
        peer_addr: PeerAddr,
        // Set by ClientAddrHandler
        remote_addr: Option<RemoteAddr>,
    }
}
