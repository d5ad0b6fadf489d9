//! Reload differ (§9 Design Notes "reload uses double-buffering ... with a
//! differ that computes the minimal effect-plumbing delta").
//!
//! Reload never destroys and rebuilds instances that survive unchanged;
//! doing so would needlessly flap VIPs, routes, and VMACs. This module only
//! computes the delta — applying it is the caller's job via
//! [`crate::effects::EffectExecutor`] and [`crate::instance::VrrpInstance`].

use std::collections::{HashMap, HashSet};

use crate::config::InstanceConfig;

/// Identifies an instance across reload by the triple that can't change
/// without it being a logically different instance (§7 "VRID collisions on
/// same interface+family+mcast").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub vrid: u8,
    pub interface: String,
    pub family_tag: &'static str,
}

impl InstanceKey {
    pub fn of(config: &InstanceConfig) -> Self {
        Self {
            vrid: config.vrid,
            interface: config.interface.clone().unwrap_or_default(),
            family_tag: match config.family {
                crate::types::Family::V4 => "v4",
                crate::types::Family::V6 => "v6",
            },
        }
    }
}

/// The result of diffing an old configured set against a new one.
#[derive(Debug)]
pub struct ReloadDelta {
    /// Instances present only in the new config: run `complete_instance`
    /// from scratch, start in INIT.
    pub added: Vec<InstanceConfig>,
    /// Instances present in both: state, timers, and tracking subscriptions
    /// carry over from the old instance; only configuration fields that
    /// actually differ are re-applied.
    pub retained: Vec<(InstanceConfig, InstanceConfig)>,
    /// Instances present only in the old config: transition to DELETED,
    /// run the same teardown as shutdown for just that instance.
    pub removed: Vec<InstanceConfig>,
}

/// Computes the minimal add/retain/remove delta. Does not mutate either
/// input; the caller re-enters surviving instances and tears down removed
/// ones.
pub fn diff(old: Vec<InstanceConfig>, new: Vec<InstanceConfig>) -> ReloadDelta {
    let mut old_by_key: HashMap<InstanceKey, InstanceConfig> =
        old.into_iter().map(|c| (InstanceKey::of(&c), c)).collect();

    let mut added = Vec::new();
    let mut retained = Vec::new();

    for new_config in new {
        let key = InstanceKey::of(&new_config);
        if let Some(old_config) = old_by_key.remove(&key) {
            retained.push((old_config, new_config));
        } else {
            added.push(new_config);
        }
    }

    let removed = old_by_key.into_values().collect();

    ReloadDelta { added, retained, removed }
}

/// Whether a retained instance's *addressable* configuration (VIPs, routes,
/// rules) changed, meaning the effect-plumbing delta is non-empty even
/// though the instance itself survives. Priority/timer-only changes don't
/// require touching installed resources.
pub fn addressable_config_changed(old: &InstanceConfig, new: &InstanceConfig) -> bool {
    old.virtual_ips != new.virtual_ips
        || old.excess_vips != new.excess_vips
        || old.virtual_routes.iter().map(route_key).collect::<HashSet<_>>()
            != new.virtual_routes.iter().map(route_key).collect::<HashSet<_>>()
        || old.virtual_rules.iter().map(rule_key).collect::<HashSet<_>>()
            != new.virtual_rules.iter().map(rule_key).collect::<HashSet<_>>()
}

fn route_key(r: &crate::config::VirtualRouteConfig) -> (std::net::IpAddr, u8) {
    (r.destination, r.prefix_len)
}

fn rule_key(r: &crate::config::VirtualRuleConfig) -> (Option<std::net::IpAddr>, Option<std::net::IpAddr>, u32) {
    (r.from, r.to, r.table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthType, Family, VrrpVersion};
    use std::time::Duration;

    fn config(vrid: u8, vips: Vec<&str>) -> InstanceConfig {
        InstanceConfig {
            iname: format!("vi_{vrid}"),
            vrid,
            family: Family::V4,
            version: VrrpVersion::V3,
            interface: Some("eth0".to_string()),
            base_priority: 100,
            adver_int: Duration::from_secs(1),
            down_timer_adverts: 3,
            virtual_ips: vips.into_iter().map(|s| s.parse().unwrap()).collect(),
            excess_vips: vec![],
            saddr: None,
            mcast_daddr: None,
            unicast_peers: vec![],
            flags: Default::default(),
            auth_type: AuthType::None,
            auth_password: None,
            virtual_routes: vec![],
            virtual_rules: vec![],
            track_scripts: vec![],
            track_files: vec![],
            track_processes: vec![],
            track_bfds: vec![],
            track_interfaces: vec![],
            sync_group: None,
            notify_backup: None,
            notify_master: None,
            notify_fault: None,
            notify_stop: None,
            notify_fifo: None,
            use_vmac: false,
            vmac_prefix: None,
        }
    }

    #[test]
    fn new_instance_is_added() {
        let delta = diff(vec![], vec![config(51, vec!["10.0.0.1"])]);
        assert_eq!(delta.added.len(), 1);
        assert!(delta.retained.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn missing_instance_is_removed() {
        let delta = diff(vec![config(51, vec!["10.0.0.1"])], vec![]);
        assert!(delta.added.is_empty());
        assert!(delta.retained.is_empty());
        assert_eq!(delta.removed.len(), 1);
    }

    #[test]
    fn matching_vrid_interface_family_is_retained() {
        let old = config(51, vec!["10.0.0.1"]);
        let new = config(51, vec!["10.0.0.1", "10.0.0.2"]);
        let delta = diff(vec![old], vec![new]);
        assert_eq!(delta.retained.len(), 1);
    }

    #[test]
    fn identical_config_produces_no_addressable_change() {
        let old = config(51, vec!["10.0.0.1"]);
        let new = config(51, vec!["10.0.0.1"]);
        assert!(!addressable_config_changed(&old, &new));
    }

    #[test]
    fn vip_set_change_is_detected() {
        let old = config(51, vec!["10.0.0.1"]);
        let new = config(51, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(addressable_config_changed(&old, &new));
    }
}
