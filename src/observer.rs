use std::net::SocketAddr;

/// Ambient event log for channel lifecycle transitions. The HTTP webhook
/// surface the teacher exposes here is out of scope; what survives is the
/// structured logging it always did alongside the hooks dispatch.
#[derive(Debug, Clone, Default)]
pub struct Observer;

impl Observer {
    pub fn new() -> Self {
        Self
    }

    pub fn member_added(&self, addr: &SocketAddr) {
        log::info!("member added: addr={addr}");
    }

    pub fn member_removed(&self, addr: &SocketAddr) {
        log::info!("member removed: addr={addr}");
    }

    pub fn client_bound(&self, addr: &SocketAddr) {
        log::info!("client bound: addr={addr}");
    }

    pub fn client_stopped(&self, addr: &SocketAddr) {
        log::info!("client stopped: addr={addr}");
    }

    /// A reassembled LonTalk frame is ready for the LRE. The router has no
    /// local LRE to hand it to directly, so this is the delivery point a
    /// real integration hooks.
    pub fn frame_delivered(&self, addr: &SocketAddr, frame: &[u8]) {
        log::debug!("frame delivered: addr={addr} len={}", frame.len());
    }

    pub fn auth_failure(&self, addr: &SocketAddr) {
        log::warn!("auth failure: addr={addr}");
    }

    pub fn protocol_committed(&self, current: bool) {
        log::info!("protocol version committed: current={current}");
    }

    pub fn persistence_error(&self, err: &dyn std::error::Error) {
        log::error!("persistence error: {err}");
    }
}
