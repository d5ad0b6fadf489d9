//! Virtual Router Redundancy Protocol engine (RFC 3768 VRRPv2, RFC 5798
//! VRRPv3) for high-availability routing and load-balancer failover.
//!
//! This crate owns the protocol: the per-instance state machine, the wire
//! codec and checksums, IPSEC-AH authentication, the tracking engine that
//! feeds priority changes and faults from scripts/files/processes/BFD/
//! interfaces, sync groups that coordinate multi-instance failover, and the
//! deterministic effect plumbing (VIPs, routes, rules, firewall accept
//! rules, GARP/NA bursts, VMAC sub-interfaces) a transition produces.
//!
//! It does not parse configuration files, run a netlink socket, or manage
//! firewall rules directly — those are external collaborator territory,
//! represented here as trait seams ([`effects`], [`vmac`], [`garp`]) so the
//! core can be driven and tested without root.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vrrp::config::InstanceConfig;
//! use vrrp::engine::{Engine, ManagedInstance, InstanceKey};
//! use vrrp::instance::VrrpInstance;
//!
//! # async fn example(config: InstanceConfig, effects: Arc<vrrp::effects::EffectExecutor>,
//! #     launcher: Arc<dyn vrrp::notify::ProcessLauncher>, fifo: Arc<dyn vrrp::notify::FifoWriter>,
//! #     l2: Arc<dyn vrrp::garp::L2AnnounceBackend>, transport: Arc<dyn vrrp::socket::VrrpTransport>) {
//! let key = InstanceKey { family: config.family, vrid: config.vrid };
//! let instance = VrrpInstance::complete_instance(config);
//! let mut engine = Engine::new(effects, launcher, fifo, l2);
//! engine.register_instance(key, ManagedInstance::new(instance, None, tokio::time::Instant::now()), transport);
//! engine.spawn_readers();
//! loop {
//!     engine.run_once().await.unwrap();
//! }
//! # }
//! ```

pub mod auth;
pub mod checksum;
pub mod config;
pub mod effects;
pub mod engine;
pub mod error;
pub mod garp;
pub mod instance;
pub mod notify;
pub mod packet;
pub mod reload;
pub mod socket;
pub mod sync_group;
pub mod tracking;
pub mod types;
pub mod vmac;

pub use config::{GlobalDefaults, InstanceConfig};
pub use engine::{build_ah_wrapper, Engine, EngineEvent, InstanceKey, ManagedInstance};
pub use error::{Error, Result};
pub use instance::VrrpInstance;
pub use packet::VrrpPacket;
pub use types::{AuthType, Family, VrrpState, VrrpVersion};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_state_display_matches_wire_level_naming() {
        assert_eq!(VrrpState::Master.to_string(), "MASTER");
    }

    #[test]
    fn public_version_as_u8_matches_rfc_numbers() {
        assert_eq!(VrrpVersion::V2.as_u8(), 2);
        assert_eq!(VrrpVersion::V3.as_u8(), 3);
    }
}
