//! Per-instance state machine (§4.4): election, preemption, down-timer
//! skew, and the decision tables for advertisements received in BACKUP and
//! MASTER. This module holds the synchronous decision logic only — sending
//! packets, installing VIPs, and running notify scripts are effects the
//! caller (normally [`crate::engine::Engine`]) carries out in response to
//! the values returned here, keeping the state machine itself trivially
//! testable without sockets or a clock.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::InstanceConfig;
use crate::error::WireError;
use crate::tracking::TrackerSet;
use crate::types::{FaultReason, VrrpState};

/// One bit per [`WireError`] kind (§7 "Each kind has a dedicated rate-limit
/// bit so it is logged at most once per episode per instance"). Cleared
/// whenever the remote master changes or the instance's own state changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateLimitFlags {
    bits: u16,
}

impl RateLimitFlags {
    fn bit(kind: WireError) -> u16 {
        1 << (kind as u16)
    }

    /// Returns true the first time `kind` is seen since the last clear;
    /// false on every subsequent occurrence of the same kind.
    pub fn should_log(&mut self, kind: WireError) -> bool {
        let bit = Self::bit(kind);
        if self.bits & bit != 0 {
            false
        } else {
            self.bits |= bit;
            true
        }
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }
}

/// Decision returned from processing an advertisement received while in
/// BACKUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupDecision {
    /// Accept the sender as master: reset the down-timer, remember its
    /// source and (for v3) its advertised interval.
    AcceptAsMaster,
    /// A priority-0 advert: shorten the down-timer to just the skew, for a
    /// fast takeover once the current master is explicitly releasing.
    FastTakeover,
    /// Lower-priority advert with preemption in force: ignored for
    /// mastership purposes, but still worth recording the source for SNMP.
    DiscardLowerPriority,
}

/// Decision returned from processing an advertisement received while in
/// MASTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterDecision {
    /// Sender outranks us: step down to BACKUP.
    BackOff,
    /// Sender priority is 0 (releasing): respond with our own advert,
    /// remain MASTER.
    RespondToRelease,
    /// Sender is lower priority than us: optionally advertise immediately,
    /// always send a GARP/NA burst, and fire `MASTER_RX_LOWER_PRI`.
    AssertSuperiority { send_advert_immediately: bool, suppress_periodic_advert: bool },
    /// Same priority, same source address as ours: another router believes
    /// it owns our address. Starts (or continues) the rogue timer.
    DuplicateOwner,
}

/// A live VRRP instance's decision-making state (§3 Data Model), excluding
/// anything that belongs to the socket/timer/effect layers.
#[derive(Debug)]
pub struct VrrpInstance {
    pub config: InstanceConfig,
    pub state: VrrpState,
    pub wantstate: VrrpState,
    pub trackers: TrackerSet,
    pub fault_reasons: HashSet<FaultReason>,
    pub rate_limit: RateLimitFlags,

    /// What the current (possibly remote) master is advertising at; v3
    /// uses this, not our own `adver_int`, to compute the down-timer.
    pub master_adver_int: Duration,
    pub last_master_source: Option<IpAddr>,

    /// Priority-254 duplicate-owner mitigation (§4.4 MASTER/duplicate).
    pub rogue_timer_active: bool,
    pub rogue_priority_dropped: bool,

    pub stats: InstanceStats,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceStats {
    pub adverts_sent: u64,
    pub adverts_received: u64,
    pub auth_failures: u64,
    pub transitions_to_master: u64,
    pub transitions_to_backup: u64,
    pub transitions_to_fault: u64,
}

impl VrrpInstance {
    /// `complete_instance`: builds runtime state from parsed config. Does
    /// not itself allocate sockets, VMACs, or a send buffer — those are the
    /// engine's responsibility, constructed once this returns successfully.
    pub fn complete_instance(config: InstanceConfig) -> Self {
        let master_adver_int = config.adver_int;
        let wantstate = if config.base_priority == crate::types::VRRP_PRIORITY_OWNER {
            VrrpState::Master
        } else {
            VrrpState::Backup
        };
        Self {
            config,
            state: VrrpState::Init,
            wantstate,
            trackers: TrackerSet::new(),
            fault_reasons: HashSet::new(),
            rate_limit: RateLimitFlags::default(),
            master_adver_int,
            last_master_source: None,
            rogue_timer_active: false,
            rogue_priority_dropped: false,
            stats: InstanceStats::default(),
        }
    }

    pub fn effective_priority(&self) -> u8 {
        if self.rogue_priority_dropped {
            return 254;
        }
        self.trackers.total_priority(self.config.base_priority)
    }

    pub fn is_address_owner(&self) -> bool {
        self.config.base_priority == crate::types::VRRP_PRIORITY_OWNER
    }

    /// §3: `ms_down_timer = (3 × master_adver_int) + skew`, where
    /// `skew = (256 − priority) × master_adver_int / 256`. Uses
    /// `down_timer_adverts` in place of the fixed multiplier 3 when
    /// configured to something else.
    pub fn down_timer(&self) -> Duration {
        let n = self.config.down_timer_adverts as u32;
        self.master_adver_int * n + self.skew()
    }

    pub fn skew(&self) -> Duration {
        let priority = self.effective_priority() as u32;
        self.master_adver_int * (256 - priority) / 256
    }

    /// Initial entry (§4.4): address owner with no faults goes MASTER
    /// directly; everyone else starts BACKUP with the down-timer armed.
    pub fn initial_state(&self) -> VrrpState {
        if self.wantstate == VrrpState::Master && self.fault_reasons.is_empty() {
            VrrpState::Master
        } else {
            VrrpState::Backup
        }
    }

    /// Enters FAULT, recording the reason (multiple reasons can be active
    /// at once; clearing one must not clear the others — §3 "rate-limit
    /// flag bitset").
    pub fn enter_fault(&mut self, reason: FaultReason) {
        self.fault_reasons.insert(reason);
        if self.state != VrrpState::Fault {
            self.state = VrrpState::Fault;
            self.stats.transitions_to_fault += 1;
            self.rate_limit.clear();
        }
    }

    /// Clears one fault reason; returns true if the instance is now clear
    /// of all faults and binary tracker faults, and so may leave FAULT.
    pub fn clear_fault(&mut self, reason: FaultReason) -> bool {
        self.fault_reasons.remove(&reason);
        self.can_leave_fault()
    }

    pub fn can_leave_fault(&self) -> bool {
        self.fault_reasons.is_empty() && self.trackers.fault_count() == 0
    }

    /// §4.4 BACKUP decision table.
    pub fn decide_backup(&mut self, advert_priority: u8, advert_src: IpAddr, advert_master_adver_int: Option<Duration>) -> BackupDecision {
        if self.last_master_source != Some(advert_src) {
            self.rate_limit.clear();
        }

        let decision = if advert_priority == 0 {
            BackupDecision::FastTakeover
        } else if self.config.flags.nopreempt
            || advert_priority >= self.effective_priority()
            || self.preempt_delay_in_force()
        {
            BackupDecision::AcceptAsMaster
        } else {
            BackupDecision::DiscardLowerPriority
        };

        if matches!(decision, BackupDecision::AcceptAsMaster | BackupDecision::FastTakeover) {
            self.last_master_source = Some(advert_src);
            if let Some(interval) = advert_master_adver_int {
                self.master_adver_int = interval;
            }
        } else {
            // Lower-priority advert: still record source for SNMP/logging.
            self.last_master_source = Some(advert_src);
        }

        decision
    }

    /// Preempt-delay is a deliberately unimplemented refinement here (no
    /// config field carries a delay duration in this expansion); always
    /// false until a `preempt_delay` field is added to `InstanceConfig`.
    fn preempt_delay_in_force(&self) -> bool {
        false
    }

    /// §4.4 MASTER decision table. `our_src` is this instance's chosen
    /// source address, used for the equal-priority tie-break and the
    /// duplicate-owner check.
    pub fn decide_master(&mut self, advert_priority: u8, advert_src: IpAddr, our_src: IpAddr) -> MasterDecision {
        if advert_priority == 0 {
            return MasterDecision::RespondToRelease;
        }

        let our_priority = self.effective_priority();

        if advert_priority == our_priority && advert_src == our_src {
            self.rogue_timer_active = true;
            return MasterDecision::DuplicateOwner;
        }

        let sender_outranks_us = advert_priority > our_priority
            || (advert_priority == our_priority && advert_src > our_src);

        if sender_outranks_us {
            MasterDecision::BackOff
        } else {
            MasterDecision::AssertSuperiority {
                send_advert_immediately: self.config.flags.higher_prio_send_advert,
                suppress_periodic_advert: self.config.flags.lower_prio_no_advert,
            }
        }
    }

    /// `1.2 × max(our adver_int, rogue's adver_int)`, the window the rogue
    /// timer runs for before declaring our priority dropped to 254.
    pub fn rogue_timer_duration(&self, rogue_adver_int: Duration) -> Duration {
        let max = self.config.adver_int.max(rogue_adver_int);
        max.mul_f64(1.2)
    }

    pub fn rogue_timer_expired_still_contested(&mut self) {
        self.rogue_priority_dropped = true;
        self.rogue_timer_active = false;
    }

    pub fn rogue_resolved(&mut self) {
        self.rogue_timer_active = false;
        self.rogue_priority_dropped = false;
    }

    pub fn transition_to_backup(&mut self) {
        self.state = VrrpState::Backup;
        self.stats.transitions_to_backup += 1;
        self.rogue_resolved();
    }

    pub fn transition_to_master(&mut self) {
        self.state = VrrpState::Master;
        self.stats.transitions_to_master += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceFlags;
    use crate::types::{AuthType, Family, VrrpVersion};

    fn base_config(base_priority: u8) -> InstanceConfig {
        InstanceConfig {
            iname: "vi_test".to_string(),
            vrid: 51,
            family: Family::V4,
            version: VrrpVersion::V3,
            interface: Some("eth0".to_string()),
            base_priority,
            adver_int: Duration::from_secs(1),
            down_timer_adverts: 3,
            virtual_ips: vec!["10.0.0.1".parse().unwrap()],
            excess_vips: vec![],
            saddr: Some("192.168.1.10".parse().unwrap()),
            mcast_daddr: None,
            unicast_peers: vec![],
            flags: InstanceFlags::default(),
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
    fn owner_with_no_faults_goes_master_directly() {
        let instance = VrrpInstance::complete_instance(base_config(255));
        assert_eq!(instance.initial_state(), VrrpState::Master);
    }

    #[test]
    fn non_owner_starts_in_backup() {
        let instance = VrrpInstance::complete_instance(base_config(100));
        assert_eq!(instance.initial_state(), VrrpState::Backup);
    }

    #[test]
    fn owner_with_a_fault_still_starts_backup() {
        let mut instance = VrrpInstance::complete_instance(base_config(255));
        instance.enter_fault(FaultReason::NoSourceIp);
        assert_eq!(instance.initial_state(), VrrpState::Backup);
    }

    #[test]
    fn down_timer_uses_masters_interval_and_skew() {
        let mut instance = VrrpInstance::complete_instance(base_config(100));
        instance.master_adver_int = Duration::from_secs(1);
        let down_timer = instance.down_timer();
        // 3 * 1s + (256-100)/256 * 1s = 3s + 0.609375s
        assert!(down_timer > Duration::from_millis(3600));
        assert!(down_timer < Duration::from_millis(3610));
    }

    #[test]
    fn backup_priority_zero_triggers_fast_takeover() {
        let mut instance = VrrpInstance::complete_instance(base_config(100));
        let decision = instance.decide_backup(0, "10.0.0.5".parse().unwrap(), None);
        assert_eq!(decision, BackupDecision::FastTakeover);
    }

    #[test]
    fn backup_accepts_higher_or_equal_priority() {
        let mut instance = VrrpInstance::complete_instance(base_config(100));
        let decision = instance.decide_backup(150, "10.0.0.5".parse().unwrap(), None);
        assert_eq!(decision, BackupDecision::AcceptAsMaster);
    }

    #[test]
    fn backup_discards_lower_priority_when_preempt_active() {
        let mut instance = VrrpInstance::complete_instance(base_config(150));
        let decision = instance.decide_backup(100, "10.0.0.5".parse().unwrap(), None);
        assert_eq!(decision, BackupDecision::DiscardLowerPriority);
    }

    #[test]
    fn backup_accepts_lower_priority_with_nopreempt() {
        let mut config = base_config(150);
        config.flags.nopreempt = true;
        let mut instance = VrrpInstance::complete_instance(config);
        let decision = instance.decide_backup(100, "10.0.0.5".parse().unwrap(), None);
        assert_eq!(decision, BackupDecision::AcceptAsMaster);
    }

    #[test]
    fn backup_changing_master_source_clears_rate_limit() {
        let mut instance = VrrpInstance::complete_instance(base_config(100));
        instance.rate_limit.should_log(WireError::BadChecksum);
        instance.decide_backup(150, "10.0.0.9".parse().unwrap(), None);
        // New source -> rate limit cleared -> should_log is true again.
        assert!(instance.rate_limit.should_log(WireError::BadChecksum));
    }

    #[test]
    fn master_backs_off_to_higher_priority_sender() {
        let mut instance = VrrpInstance::complete_instance(base_config(100));
        let our_src: IpAddr = "192.168.1.10".parse().unwrap();
        let decision = instance.decide_master(150, "10.0.0.5".parse().unwrap(), our_src);
        assert_eq!(decision, MasterDecision::BackOff);
    }

    #[test]
    fn master_asserts_superiority_over_lower_priority_sender() {
        let mut instance = VrrpInstance::complete_instance(base_config(150));
        let our_src: IpAddr = "192.168.1.10".parse().unwrap();
        let decision = instance.decide_master(100, "10.0.0.5".parse().unwrap(), our_src);
        assert!(matches!(decision, MasterDecision::AssertSuperiority { .. }));
    }

    #[test]
    fn master_responds_to_release_and_stays_master() {
        let mut instance = VrrpInstance::complete_instance(base_config(150));
        let our_src: IpAddr = "192.168.1.10".parse().unwrap();
        let decision = instance.decide_master(0, "10.0.0.5".parse().unwrap(), our_src);
        assert_eq!(decision, MasterDecision::RespondToRelease);
    }

    #[test]
    fn master_detects_duplicate_owner_on_matching_source_and_priority() {
        let mut instance = VrrpInstance::complete_instance(base_config(150));
        let our_src: IpAddr = "192.168.1.10".parse().unwrap();
        let decision = instance.decide_master(150, our_src, our_src);
        assert_eq!(decision, MasterDecision::DuplicateOwner);
        assert!(instance.rogue_timer_active);
    }

    #[test]
    fn equal_priority_tiebreaks_on_source_address() {
        let mut instance = VrrpInstance::complete_instance(base_config(150));
        let our_src: IpAddr = "192.168.1.10".parse().unwrap();
        let higher_src: IpAddr = "192.168.1.200".parse().unwrap();
        assert_eq!(instance.decide_master(150, higher_src, our_src), MasterDecision::BackOff);
    }

    #[test]
    fn rogue_timer_expiry_drops_priority_to_254() {
        let mut instance = VrrpInstance::complete_instance(base_config(150));
        instance.rogue_timer_active = true;
        instance.rogue_timer_expired_still_contested();
        assert_eq!(instance.effective_priority(), 254);
        assert!(!instance.rogue_timer_active);
    }

    #[test]
    fn rogue_timer_duration_is_1_2x_the_larger_interval() {
        let instance = VrrpInstance::complete_instance(base_config(150));
        let duration = instance.rogue_timer_duration(Duration::from_secs(2));
        assert_eq!(duration, Duration::from_millis(2400));
    }

    #[test]
    fn fault_reasons_are_independent() {
        let mut instance = VrrpInstance::complete_instance(base_config(100));
        instance.enter_fault(FaultReason::NoSourceIp);
        instance.enter_fault(FaultReason::InterfaceDown);
        assert!(!instance.clear_fault(FaultReason::NoSourceIp));
        assert!(instance.clear_fault(FaultReason::InterfaceDown));
    }

    #[test]
    fn address_owner_priority_is_unaffected_by_trackers() {
        let instance = VrrpInstance::complete_instance(base_config(255));
        assert_eq!(instance.effective_priority(), 255);
        assert!(instance.is_address_owner());
    }
}
