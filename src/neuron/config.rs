use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use typed_builder::TypedBuilder;

use super::net::SYNAPSE_PORT;

/// Runtime configuration of one node. Everything except `identity` and `k`
/// has a default.
#[derive(TypedBuilder, Clone, Debug)]
pub struct NeuronConfig {
    /// Name this node answers as, also the sender identity it puts on its
    /// own downstream calls.
    pub identity: String,

    #[builder(default = SocketAddr::from((Ipv4Addr::UNSPECIFIED, SYNAPSE_PORT)))]
    pub bind_addr: SocketAddr,

    /// Number of downstream peer slots. Fixed for the lifetime of the node.
    pub k: usize,

    /// Column count every downstream response must have.
    #[builder(default = 128)]
    pub feature_dim: u32,

    /// Budget for one downstream RPC, forward and backward alike.
    #[builder(default = Duration::from_millis(500))]
    pub peer_timeout: Duration,

    #[builder(default = Duration::from_secs(1))]
    pub learn_interval: Duration,

    /// Cache capacity; beyond it the oldest ungraded entry is dropped.
    #[builder(default = 4096)]
    pub max_entries: usize,

    /// Age after which an entry that never received a grade is expired.
    #[builder(default = chrono::Duration::seconds(300))]
    pub entry_ttl: chrono::Duration,

    /// Permits on the inbound RPC semaphore.
    #[builder(default = 64)]
    pub max_inflight_rpcs: usize,
}
