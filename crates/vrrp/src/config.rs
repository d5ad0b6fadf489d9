//! Parsed configuration tree.
//!
//! This crate does not parse configuration files — that is external
//! collaborator territory (CLI flags, file format, included files). What it
//! does own is the shape of the tree an external parser must hand over:
//! plain, serializable structs that [`crate::instance::VrrpInstance`]
//! completes into runtime state via `complete_instance`.
//!
//! Field shapes follow the conventions this workspace already used for
//! daemon configuration (nested settings structs, `#[serde(default)]`,
//! `humantime_serde` for `Duration`s).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::types::{AuthType, Family, VrrpVersion};

/// Global defaults applied to instances that don't override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDefaults {
    #[serde(default = "default_mcast_v4")]
    pub vrrp_mcast_group4: IpAddr,

    #[serde(default = "default_mcast_v6")]
    pub vrrp_mcast_group6: IpAddr,

    #[serde(default)]
    pub strict_mode: bool,

    #[serde(default = "default_garp_repeat")]
    pub garp_repeat: u32,

    #[serde(default = "default_garp_delay", with = "humantime_serde")]
    pub garp_delay: Duration,

    #[serde(default = "default_garp_refresh", with = "humantime_serde")]
    pub garp_refresh: Duration,

    #[serde(default)]
    pub firewall_backend: FirewallBackendKind,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            vrrp_mcast_group4: default_mcast_v4(),
            vrrp_mcast_group6: default_mcast_v6(),
            strict_mode: false,
            garp_repeat: default_garp_repeat(),
            garp_delay: default_garp_delay(),
            garp_refresh: default_garp_refresh(),
            firewall_backend: FirewallBackendKind::default(),
        }
    }
}

fn default_mcast_v4() -> IpAddr {
    "224.0.0.18".parse().unwrap()
}

fn default_mcast_v6() -> IpAddr {
    "ff02::12".parse().unwrap()
}

fn default_garp_repeat() -> u32 {
    5
}

fn default_garp_delay() -> Duration {
    Duration::from_millis(5)
}

fn default_garp_refresh() -> Duration {
    Duration::ZERO
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirewallBackendKind {
    #[default]
    Nftables,
    Iptables,
    None,
}

/// One configured VRRP instance, as an external parser would build it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub iname: String,
    pub vrid: u8,
    pub family: Family,
    pub version: VrrpVersion,
    pub interface: Option<String>,

    pub base_priority: u8,

    #[serde(with = "humantime_serde")]
    pub adver_int: Duration,

    #[serde(default = "default_down_timer_adverts")]
    pub down_timer_adverts: u8,

    pub virtual_ips: Vec<IpAddr>,
    #[serde(default)]
    pub excess_vips: Vec<IpAddr>,

    pub saddr: Option<IpAddr>,
    pub mcast_daddr: Option<IpAddr>,
    #[serde(default)]
    pub unicast_peers: Vec<IpAddr>,

    #[serde(default)]
    pub flags: InstanceFlags,

    #[serde(default)]
    pub auth_type: AuthType,
    pub auth_password: Option<String>,

    #[serde(default)]
    pub virtual_routes: Vec<VirtualRouteConfig>,
    #[serde(default)]
    pub virtual_rules: Vec<VirtualRuleConfig>,

    #[serde(default)]
    pub track_scripts: Vec<TrackScriptConfig>,
    #[serde(default)]
    pub track_files: Vec<TrackFileConfig>,
    #[serde(default)]
    pub track_processes: Vec<TrackProcessConfig>,
    #[serde(default)]
    pub track_bfds: Vec<TrackBfdConfig>,
    #[serde(default)]
    pub track_interfaces: Vec<TrackInterfaceConfig>,

    pub sync_group: Option<String>,

    pub notify_backup: Option<String>,
    pub notify_master: Option<String>,
    pub notify_fault: Option<String>,
    pub notify_stop: Option<String>,
    pub notify_fifo: Option<String>,

    #[serde(default)]
    pub use_vmac: bool,
    pub vmac_prefix: Option<String>,
}

fn default_down_timer_adverts() -> u8 {
    3
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InstanceFlags {
    pub unicast: bool,
    pub nopreempt: bool,
    pub strict_mode: bool,
    pub v3_checksum_as_v2: bool,
    pub accept_mode: bool,
    pub promote_secondaries: bool,
    pub skip_check_adv_addr: bool,
    pub saddr_from_config: bool,
    pub track_saddr: bool,
    pub unicast_check_src: bool,
    pub allow_no_vips: bool,
    pub higher_prio_send_advert: bool,
    pub lower_prio_no_advert: bool,
    pub vmac_on_base_xmit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualRouteConfig {
    pub destination: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub table: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualRuleConfig {
    pub from: Option<IpAddr>,
    pub to: Option<IpAddr>,
    pub table: u32,
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackScriptConfig {
    pub name: String,
    pub command: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_rise_fall")]
    pub rise: u32,
    #[serde(default = "default_rise_fall")]
    pub fall: u32,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub reverse: bool,
}

fn default_rise_fall() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackFileConfig {
    pub name: String,
    pub path: std::path::PathBuf,
    #[serde(default = "default_file_weight")]
    pub weight: i32,
    #[serde(default)]
    pub reverse: bool,
}

fn default_file_weight() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackProcessConfig {
    pub name: String,
    pub process_names: Vec<String>,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub quorum: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackBfdConfig {
    pub name: String,
    pub peer: IpAddr,
    #[serde(default)]
    pub weight: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInterfaceConfig {
    pub interface: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(with = "humantime_serde", default)]
    pub debounce_up: Duration,
    #[serde(with = "humantime_serde", default)]
    pub debounce_down: Duration,
}

/// A named sync group tying together a set of instances' state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncGroupConfig {
    pub name: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub sgroup_tracking_weight: bool,
    pub notify_backup: Option<String>,
    pub notify_master: Option<String>,
    pub notify_fault: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_flags_default_to_false() {
        let flags = InstanceFlags::default();
        assert!(!flags.unicast);
        assert!(!flags.nopreempt);
    }

    #[test]
    fn global_defaults_match_rfc_mcast_groups() {
        let defaults = GlobalDefaults::default();
        assert_eq!(defaults.vrrp_mcast_group4, "224.0.0.18".parse::<IpAddr>().unwrap());
        assert_eq!(defaults.vrrp_mcast_group6, "ff02::12".parse::<IpAddr>().unwrap());
    }
}
