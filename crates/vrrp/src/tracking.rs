//! Tracking engine: external conditions that adjust an instance's
//! `effective_priority` or contribute to its fault count.
//!
//! Every tracker kind (script, file, process, BFD peer, interface,
//! route/rule) reduces to the same two-shaped contract: either it is
//! *binary* (weight 0 — up/down only affects the fault counter) or it is
//! *weighted* (non-zero weight — its value times a per-subscriber
//! multiplier is summed into `total_priority`).

use std::collections::HashMap;

/// One subscriber's view of a tracker: the multiplier applied to the
/// tracker's raw value, and whether the sense is inverted.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub weight: i32,
    pub reverse: bool,
}

impl Subscription {
    /// Binary trackers ignore `weight`/`reverse` on the contribution side;
    /// they only ever flip `up`/`down`.
    pub fn is_binary(&self) -> bool {
        self.weight == 0
    }

    fn signed_weight(&self) -> i32 {
        if self.reverse { -self.weight } else { self.weight }
    }
}

/// The current observed state of one tracked external condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    Up,
    Down,
}

/// Identifies a tracked subject by kind and name, for logging and for
/// routing tracker events to the right [`TrackerSet`] entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerId {
    pub kind: TrackerKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerKind {
    Script,
    File,
    Process,
    Bfd,
    Interface,
    Route,
    Rule,
}

/// Per-instance aggregation of all trackers it subscribes to. Lives on
/// [`crate::instance::VrrpInstance`]; updated whenever a tracker event
/// arrives, then consulted to recompute `total_priority` and fault count.
#[derive(Debug, Default)]
pub struct TrackerSet {
    subs: HashMap<TrackerId, (Subscription, TrackerStatus, i64)>,
    fault_count: u32,
}

impl TrackerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A freshly subscribed tracker is assumed up until the first real
    /// observation says otherwise, so subscribing never by itself raises
    /// the fault count.
    pub fn subscribe(&mut self, id: TrackerId, sub: Subscription) {
        self.subs.insert(id, (sub, TrackerStatus::Up, 0));
    }

    /// Binary tracker transition. Returns the new fault count so the caller
    /// can decide whether to clear or enter FAULT.
    pub fn update_binary(&mut self, id: &TrackerId, status: TrackerStatus) -> u32 {
        if let Some((sub, current, _)) = self.subs.get_mut(id) {
            debug_assert!(sub.is_binary(), "update_binary called on a weighted tracker");
            if *current != status {
                match status {
                    TrackerStatus::Down => self.fault_count += 1,
                    TrackerStatus::Up => self.fault_count = self.fault_count.saturating_sub(1),
                }
                *current = status;
            }
        }
        self.fault_count
    }

    /// Weighted tracker value update (e.g. a track-file's numeric content,
    /// or a script's rise/fall-debounced success count).
    pub fn update_weighted(&mut self, id: &TrackerId, value: i64) {
        if let Some((sub, _, current_value)) = self.subs.get_mut(id) {
            debug_assert!(!sub.is_binary(), "update_weighted called on a binary tracker");
            *current_value = value;
        }
    }

    pub fn fault_count(&self) -> u32 {
        self.fault_count
    }

    /// §4.3 aggregation: `total_priority = clamp[1,254](base + Σ value *
    /// multiplier)`, unless `base_priority == 255` (address owner), in
    /// which case weighted trackers must have been rejected at
    /// `complete_instance` time and this always returns 255 unchanged.
    pub fn total_priority(&self, base_priority: u8) -> u8 {
        if base_priority == crate::types::VRRP_PRIORITY_OWNER {
            return crate::types::VRRP_PRIORITY_OWNER;
        }
        let mut total: i64 = base_priority as i64;
        for (sub, _, value) in self.subs.values() {
            if !sub.is_binary() {
                total += value * sub.signed_weight() as i64;
            }
        }
        total.clamp(1, 254) as u8
    }
}

/// Rise/fall debounce for script trackers (§4.3): a script must succeed
/// `rise` consecutive times to be considered up, or fail `fall` consecutive
/// times to be considered down. Intermediate results don't flip state.
#[derive(Debug, Clone)]
pub struct RiseFallCounter {
    rise: u32,
    fall: u32,
    consecutive_success: u32,
    consecutive_failure: u32,
    status: TrackerStatus,
}

impl RiseFallCounter {
    pub fn new(rise: u32, fall: u32) -> Self {
        Self {
            rise: rise.max(1),
            fall: fall.max(1),
            consecutive_success: 0,
            consecutive_failure: 0,
            status: TrackerStatus::Down,
        }
    }

    /// Feeds one script run result; returns `Some(new_status)` only on an
    /// actual transition, `None` if still debouncing.
    pub fn record(&mut self, succeeded: bool) -> Option<TrackerStatus> {
        if succeeded {
            self.consecutive_failure = 0;
            self.consecutive_success += 1;
            if self.status == TrackerStatus::Down && self.consecutive_success >= self.rise {
                self.status = TrackerStatus::Up;
                return Some(TrackerStatus::Up);
            }
        } else {
            self.consecutive_success = 0;
            self.consecutive_failure += 1;
            if self.status == TrackerStatus::Up && self.consecutive_failure >= self.fall {
                self.status = TrackerStatus::Down;
                return Some(TrackerStatus::Down);
            }
        }
        None
    }
}

/// Interface-link debounce timers (§4.3): must not exceed `(down_timer_adverts
/// − 1) × master_adver_int − master_adver_int/256`, auto-reduced if the
/// configured value is larger so a flapping interface can't outlive the
/// backup's own down-timer.
pub fn clamp_interface_debounce(
    configured: std::time::Duration,
    down_timer_adverts: u8,
    master_adver_int: std::time::Duration,
) -> std::time::Duration {
    let n = down_timer_adverts.saturating_sub(1) as u32;
    let max = master_adver_int
        .saturating_mul(n)
        .saturating_sub(master_adver_int / 256);
    configured.min(max)
}

/// Process-presence tracker with quorum support (§4.3 Process): up iff at
/// least `quorum` of the named processes are currently running.
pub fn process_tracker_status(running_count: u32, quorum: u32) -> TrackerStatus {
    if running_count >= quorum.max(1) {
        TrackerStatus::Up
    } else {
        TrackerStatus::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_id(name: &str) -> TrackerId {
        TrackerId { kind: TrackerKind::Script, name: name.to_string() }
    }

    #[test]
    fn binary_tracker_down_increments_fault_then_clears() {
        let mut set = TrackerSet::new();
        let id = script_id("link_check");
        set.subscribe(id.clone(), Subscription { weight: 0, reverse: false });
        assert_eq!(set.fault_count(), 0);

        assert_eq!(set.update_binary(&id, TrackerStatus::Down), 1);
        assert_eq!(set.update_binary(&id, TrackerStatus::Down), 1);
        assert_eq!(set.update_binary(&id, TrackerStatus::Up), 0);
    }

    #[test]
    fn weighted_tracker_contributes_to_total_priority() {
        let mut set = TrackerSet::new();
        let id = script_id("health");
        set.subscribe(id.clone(), Subscription { weight: 10, reverse: false });
        set.update_weighted(&id, 3);
        assert_eq!(set.total_priority(100), 130);
    }

    #[test]
    fn reverse_weighted_tracker_subtracts() {
        let mut set = TrackerSet::new();
        let id = script_id("load");
        set.subscribe(id.clone(), Subscription { weight: 10, reverse: true });
        set.update_weighted(&id, 3);
        assert_eq!(set.total_priority(100), 70);
    }

    #[test]
    fn total_priority_clamps_to_1_254() {
        let mut set = TrackerSet::new();
        let id = script_id("crushing");
        set.subscribe(id.clone(), Subscription { weight: 1000, reverse: true });
        set.update_weighted(&id, 1);
        assert_eq!(set.total_priority(100), 1);
    }

    #[test]
    fn address_owner_priority_is_never_altered() {
        let mut set = TrackerSet::new();
        let id = script_id("whatever");
        set.subscribe(id.clone(), Subscription { weight: 50, reverse: false });
        set.update_weighted(&id, 10);
        assert_eq!(set.total_priority(255), 255);
    }

    #[test]
    fn rise_fall_counter_debounces_transitions() {
        let mut counter = RiseFallCounter::new(2, 3);
        assert_eq!(counter.record(true), None);
        assert_eq!(counter.record(true), Some(TrackerStatus::Up));
        assert_eq!(counter.record(false), None);
        assert_eq!(counter.record(false), None);
        assert_eq!(counter.record(false), Some(TrackerStatus::Down));
    }

    #[test]
    fn interface_debounce_is_clamped() {
        use std::time::Duration;
        let master_adver_int = Duration::from_secs(1);
        let clamped = clamp_interface_debounce(Duration::from_secs(100), 3, master_adver_int);
        assert!(clamped <= master_adver_int * 2);
    }

    #[test]
    fn process_quorum_is_respected() {
        assert_eq!(process_tracker_status(2, 3), TrackerStatus::Down);
        assert_eq!(process_tracker_status(3, 3), TrackerStatus::Up);
    }
}
