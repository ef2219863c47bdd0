pub mod client;
pub mod config;
pub mod dispatch;
pub mod master;
pub mod member;
pub mod stats;

mod error;

pub use client::{ChannelRoutingDescriptor, ClientState, InboundFrame, OutboundOutcome, PerPeerClient, RouterType};
pub use config::{BandwidthBudget, ChannelOptions};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::Error;
pub use master::{random_session_id, ChannelMaster, ProtocolCommitment, Work};
pub use member::{decode_members_body, encode_members_body, Member, MemberTable, MembershipChange};
pub use stats::{ChannelStats, Stat};
