use std::net::{Ipv4Addr, SocketAddr};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Channel-wide policy options (§6 "Configurable options"), all persisted.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelOptions {
    #[cfg_attr(feature = "serde", serde(default = "ChannelOptions::default_aggregate"))]
    pub aggregate: bool,
    #[cfg_attr(feature = "serde", serde(default = "ChannelOptions::default_aggregate_window_ms"))]
    pub aggregate_window_ms: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub bw_limit: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub bw_limit_kb_per_sec: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub reorder: bool,
    #[cfg_attr(feature = "serde", serde(default = "ChannelOptions::default_reorder_escrow_ms"))]
    pub reorder_escrow_ms: u32,
    #[cfg_attr(feature = "serde", serde(default = "ChannelOptions::default_channel_timeout_ms"))]
    pub channel_timeout_ms: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub staleness_check: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub use_tos: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub tos_bits: u8,
    #[cfg_attr(feature = "serde", serde(default))]
    pub authenticate: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub eia852_strict: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub secret: [u8; 16],
    #[cfg_attr(feature = "serde", serde(default = "ChannelOptions::default_device_name"))]
    pub device_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub nat_address: Option<Ipv4Addr>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub multicast_group: Option<Ipv4Addr>,
    #[cfg_attr(feature = "serde", serde(default = "ChannelOptions::default_multicast_hops"))]
    pub multicast_hops: u8,
    #[cfg_attr(feature = "serde", serde(default))]
    pub ntp_servers: Vec<SocketAddr>,
}

impl ChannelOptions {
    fn default_aggregate() -> bool {
        true
    }

    fn default_aggregate_window_ms() -> u32 {
        100
    }

    fn default_reorder_escrow_ms() -> u32 {
        50
    }

    fn default_channel_timeout_ms() -> u32 {
        1500
    }

    fn default_device_name() -> String {
        "lonip-router".to_string()
    }

    fn default_multicast_hops() -> u8 {
        1
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            aggregate: Self::default_aggregate(),
            aggregate_window_ms: Self::default_aggregate_window_ms(),
            bw_limit: false,
            bw_limit_kb_per_sec: 0,
            reorder: true,
            reorder_escrow_ms: Self::default_reorder_escrow_ms(),
            channel_timeout_ms: Self::default_channel_timeout_ms(),
            staleness_check: true,
            use_tos: false,
            tos_bits: 0,
            authenticate: false,
            eia852_strict: false,
            secret: [0u8; 16],
            device_name: Self::default_device_name(),
            nat_address: None,
            multicast_group: None,
            multicast_hops: Self::default_multicast_hops(),
            ntp_servers: Vec::new(),
        }
    }
}

/// Bandwidth-limit throttle: a fixed number of send slots replenished once
/// per second (§4.4's "30-slot-per-second budget").
#[derive(Debug, Clone)]
pub struct BandwidthBudget {
    slots_per_second: u32,
    remaining: u32,
    last_refill_ms: u64,
}

impl BandwidthBudget {
    pub const SLOTS_PER_SECOND: u32 = 30;

    pub fn new(now_ms: u64) -> Self {
        Self {
            slots_per_second: Self::SLOTS_PER_SECOND,
            remaining: Self::SLOTS_PER_SECOND,
            last_refill_ms: now_ms,
        }
    }

    pub fn try_take(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_refill_ms) >= 1000 {
            self.remaining = self.slots_per_second;
            self.last_refill_ms = now_ms;
        }

        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }
}
