//! Cooperative single-threaded scheduler (§5) tying the wire codec, socket
//! pool, state machine, effect plumbing, and tracking engine together.
//!
//! Generalizes the one-instance-one-socket `tokio::select!` loop into a
//! many-instance, socket-pool-keyed fan-in: one task per registered
//! transport reads datagrams and feeds them to the engine, which
//! demultiplexes by `(family, vrid)`, then drives whichever
//! [`crate::instance::VrrpInstance`] owns that VRID.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::{self, AhHeader, AhReplayState};
use crate::config::{GlobalDefaults, InstanceConfig};
use crate::effects::{EffectExecutor, InstanceResources, NetlinkEvent};
use crate::error::{Error, Result, WireError};
use crate::garp::GarpSender;
use crate::instance::{BackupDecision, MasterDecision, VrrpInstance};
use crate::notify::{NotifyContext, NotifyOutcome, Notifier};
use crate::packet::VrrpPacket;
use crate::socket::{default_mcast_group, RawDatagram, VrrpTransport};
use crate::sync_group::{MemberId, Proposal, SyncGroup};
use crate::tracking::{TrackerId, TrackerStatus};
use crate::types::{
    AuthType, Family, FaultReason, NotifyEvent, VrrpState, VrrpVersion, VRRP_IP_TTL, VRRP_PRIORITY_RELEASE, VRRP_V2_AUTH_LEN,
};

/// Routes an inbound datagram to the instance that owns it, mirroring the
/// socket pool's demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub family: Family,
    pub vrid: u8,
}

/// Everything the engine needs to drive one instance's advert cycle, beyond
/// the pure decision logic in [`VrrpInstance`].
pub struct ManagedInstance {
    pub instance: VrrpInstance,
    pub sync_group: Option<(String, MemberId)>,
    pub ah_replay: AhReplayState,
    pub ah_tx_seq: AhReplayState,
    pub next_advert_at: Instant,
    pub down_timer_at: Instant,
    /// Per-peer v3 checksum-compat auto-detection (§9): `true` once a peer
    /// has been observed sending v3 adverts checksummed the v2 way (no
    /// pseudo-header), so later packets from it are checked the same way.
    pub checksum_compat: HashMap<IpAddr, bool>,
}

impl ManagedInstance {
    pub fn new(instance: VrrpInstance, sync_group: Option<(String, MemberId)>, now: Instant) -> Self {
        Self {
            instance,
            sync_group,
            ah_replay: AhReplayState::new(),
            ah_tx_seq: AhReplayState::new(),
            next_advert_at: now,
            down_timer_at: now,
            checksum_compat: HashMap::new(),
        }
    }
}

/// Owns all instances and sync groups and runs the event loop described in
/// §5. An embedder outside this crate constructs one `Engine` per process.
pub struct Engine {
    instances: HashMap<InstanceKey, ManagedInstance>,
    sync_groups: HashMap<String, SyncGroup>,
    transports: HashMap<InstanceKey, Arc<dyn VrrpTransport>>,
    effects: Arc<EffectExecutor>,
    notifier_launcher: Arc<dyn crate::notify::ProcessLauncher>,
    notifier_fifo: Arc<dyn crate::notify::FifoWriter>,
    l2_backend: Arc<dyn crate::garp::L2AnnounceBackend>,
    defaults: GlobalDefaults,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<EngineEvent>>,
}

/// Internal events the loop reacts to: datagrams off the socket pool,
/// instance timers, and (§4.3/§4.4) tracker and netlink events that can
/// push an instance into or out of FAULT.
pub enum EngineEvent {
    Datagram { key: InstanceKey, datagram: RawDatagram },
    AdvertTimerFired { key: InstanceKey },
    DownTimerFired { key: InstanceKey },
    /// A binary or weighted tracker's observed status changed.
    TrackerStatusChanged { key: InstanceKey, tracker: TrackerId, status: TrackerStatus },
    /// A weighted tracker's value changed (adjusts `effective_priority`, no
    /// fault implication).
    TrackerValueChanged { key: InstanceKey, tracker: TrackerId, value: i64 },
    /// Netlink link/address/route change relevant to one instance.
    Netlink { key: InstanceKey, event: NetlinkEvent },
    /// Periodic `garp_refresh` tick while remaining MASTER (§4.6).
    GarpRefreshDue { key: InstanceKey },
}

impl Engine {
    pub fn new(
        effects: Arc<EffectExecutor>,
        notifier_launcher: Arc<dyn crate::notify::ProcessLauncher>,
        notifier_fifo: Arc<dyn crate::notify::FifoWriter>,
        l2_backend: Arc<dyn crate::garp::L2AnnounceBackend>,
        defaults: GlobalDefaults,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            instances: HashMap::new(),
            sync_groups: HashMap::new(),
            transports: HashMap::new(),
            effects,
            notifier_launcher,
            notifier_fifo,
            l2_backend,
            defaults,
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    pub fn register_instance(&mut self, key: InstanceKey, managed: ManagedInstance, transport: Arc<dyn VrrpTransport>) {
        self.transports.insert(key, transport);
        self.instances.insert(key, managed);
    }

    pub fn register_sync_group(&mut self, group: SyncGroup) {
        self.sync_groups.insert(group.name.clone(), group);
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.events_tx.clone()
    }

    /// Current state of one registered instance, for SNMP/metrics exposure
    /// and tests; `None` if no instance is registered under `key`.
    pub fn state_of(&self, key: InstanceKey) -> Option<VrrpState> {
        self.instances.get(&key).map(|m| m.instance.state)
    }

    /// Copy of one registered instance's wire counters.
    pub fn stats_of(&self, key: InstanceKey) -> Option<crate::instance::InstanceStats> {
        self.instances.get(&key).map(|m| m.instance.stats)
    }

    /// Spawns one reader task per registered transport, feeding datagrams
    /// into the shared event channel in arrival order.
    pub fn spawn_readers(&self) {
        for (key, transport) in &self.transports {
            let key = *key;
            let transport = transport.clone();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match transport.recv().await {
                        Ok(datagram) => {
                            if tx.send(EngineEvent::Datagram { key, datagram }).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(?key, error = %err, "transport read failed");
                            break;
                        }
                    }
                }
            });
        }
    }

    /// Runs one iteration of the event loop: waits for the next event and
    /// dispatches it to completion before returning — each handler runs to
    /// completion before the next event is drawn.
    pub async fn run_once(&mut self) -> Result<()> {
        let event = {
            let mut rx = self.events_rx.lock().await;
            rx.recv().await
        };
        match event {
            Some(EngineEvent::Datagram { key, datagram }) => self.handle_datagram(key, datagram).await,
            Some(EngineEvent::AdvertTimerFired { key }) => self.handle_advert_timer(key).await,
            Some(EngineEvent::DownTimerFired { key }) => self.handle_down_timer(key).await,
            Some(EngineEvent::TrackerStatusChanged { key, tracker, status }) => {
                self.handle_tracker_status(key, tracker, status).await
            }
            Some(EngineEvent::TrackerValueChanged { key, tracker, value }) => {
                self.handle_tracker_value(key, tracker, value).await
            }
            Some(EngineEvent::Netlink { key, event }) => self.handle_netlink_event(key, event).await,
            Some(EngineEvent::GarpRefreshDue { key }) => self.handle_garp_refresh(key).await,
            None => Ok(()),
        }
    }

    /// A binary tracker's up/down transition. The tracker's own fault count
    /// (which can reflect several subscribed trackers at once) decides
    /// whether the instance as a whole is in or out of FAULT, not just this
    /// one event's direction (§4.3).
    async fn handle_tracker_status(&mut self, key: InstanceKey, tracker: TrackerId, status: TrackerStatus) -> Result<()> {
        let fault_count = match self.instances.get_mut(&key) {
            Some(managed) => managed.instance.trackers.update_binary(&tracker, status),
            None => return Ok(()),
        };
        if fault_count > 0 {
            self.enter_fault(key, FaultReason::TrackFault).await
        } else {
            self.clear_fault(key, FaultReason::TrackFault).await
        }
    }

    /// A weighted tracker's value changed; this only ever adjusts
    /// `effective_priority`, never FAULT, so no state re-evaluation is
    /// needed beyond recording the new value.
    async fn handle_tracker_value(&mut self, key: InstanceKey, tracker: TrackerId, value: i64) -> Result<()> {
        if let Some(managed) = self.instances.get_mut(&key) {
            managed.instance.trackers.update_weighted(&tracker, value);
        }
        Ok(())
    }

    /// Netlink link-state changes on an instance's base interface (§4.3
    /// Interface tracking, §4.4 FAULT entry/exit on interface down/up).
    async fn handle_netlink_event(&mut self, key: InstanceKey, event: NetlinkEvent) -> Result<()> {
        let interface = match self.instances.get(&key) {
            Some(managed) => managed.instance.config.interface.clone().unwrap_or_default(),
            None => return Ok(()),
        };
        match event {
            NetlinkEvent::LinkDown(iface) if iface == interface => self.enter_fault(key, FaultReason::InterfaceDown).await,
            NetlinkEvent::LinkUp(iface) if iface == interface => self.clear_fault(key, FaultReason::InterfaceDown).await,
            _ => Ok(()),
        }
    }

    /// Enters FAULT for `reason` (§4.4): if currently MASTER, relinquishes
    /// the protected resources first, then notifies.
    async fn enter_fault(&mut self, key: InstanceKey, reason: FaultReason) -> Result<()> {
        let was_master = self.instances.get(&key).map(|m| m.instance.state) == Some(VrrpState::Master);
        match self.instances.get_mut(&key) {
            Some(managed) => managed.instance.enter_fault(reason),
            None => return Ok(()),
        }
        if was_master {
            self.apply_effects(key, false).await?;
        }
        self.notify(key, NotifyEvent::Fault).await;
        Ok(())
    }

    /// Clears one fault reason and, if no fault reasons or tracker faults
    /// remain, re-evaluates state: address owners go straight back to
    /// MASTER, everyone else becomes BACKUP with a freshly armed
    /// down-timer (mirrors `VrrpInstance::initial_state`).
    async fn clear_fault(&mut self, key: InstanceKey, reason: FaultReason) -> Result<()> {
        let can_leave = match self.instances.get_mut(&key) {
            Some(managed) => managed.instance.clear_fault(reason),
            None => return Ok(()),
        };
        if !can_leave {
            return Ok(());
        }
        let wantstate = self.instances[&key].instance.wantstate;
        if wantstate == VrrpState::Master {
            self.transition_to_master(key).await
        } else {
            {
                let managed = self.instances.get_mut(&key).expect("checked above");
                managed.instance.transition_to_backup();
                managed.down_timer_at = Instant::now() + managed.instance.down_timer();
            }
            self.notify(key, NotifyEvent::Backup).await;
            Ok(())
        }
    }

    /// Periodic `garp_refresh` tick (§4.6): only meaningful while MASTER and
    /// only if a nonzero refresh interval is configured.
    async fn handle_garp_refresh(&mut self, key: InstanceKey) -> Result<()> {
        let is_master = self.instances.get(&key).map(|m| m.instance.state) == Some(VrrpState::Master);
        if !is_master || self.defaults.garp_refresh.is_zero() {
            return Ok(());
        }
        let managed = self.instances.get(&key).expect("checked above");
        let interface = managed.instance.config.interface.clone().unwrap_or_default();
        let vips = managed.instance.config.virtual_ips.clone();
        let sender = GarpSender::new(self.l2_backend.as_ref());
        for vip in vips {
            sender.refresh_once(&interface, vip).await?;
        }
        Ok(())
    }

    /// Graceful shutdown (§4.4 "Leaving MASTER ... shutdown", §6 STOP, §8
    /// idempotent-STOP): if currently MASTER, sends one priority-0 advert
    /// and relinquishes resources before notifying STOP. Idempotent — a
    /// second call against an already-stopped instance is a no-op.
    pub async fn stop(&mut self, key: InstanceKey) -> Result<()> {
        let state = match self.instances.get(&key).map(|m| m.instance.state) {
            Some(s) => s,
            None => return Ok(()),
        };
        if state == VrrpState::Deleted {
            return Ok(());
        }
        if state == VrrpState::Master {
            self.send_advert_with_priority(key, Some(VRRP_PRIORITY_RELEASE)).await?;
            self.apply_effects(key, false).await?;
        }
        {
            let managed = self.instances.get_mut(&key).expect("checked above");
            managed.instance.state = VrrpState::Deleted;
        }
        self.notify(key, NotifyEvent::Stop).await;
        Ok(())
    }

    async fn handle_datagram(&mut self, key: InstanceKey, datagram: RawDatagram) -> Result<()> {
        if !self.instances.contains_key(&key) {
            return Ok(()); // no instance owns this VRID; silently drop
        }

        let uses_ah = self.instances[&key].instance.config.auth_type == AuthType::IpsecAh;

        let vrrp_bytes: &[u8] = if uses_ah {
            match AhHeader::parse(&datagram.bytes) {
                Ok((header, icv)) => {
                    let payload = &datagram.bytes[auth::AH_HEADER_LEN + auth::AH_ICV_LEN..];
                    let password = self.instances[&key]
                        .instance
                        .config
                        .auth_password
                        .as_deref()
                        .unwrap_or("")
                        .as_bytes();
                    if !auth::verify_icv(password, &header, payload, icv) {
                        self.note_wire_error(key, WireError::AuthFailure);
                        return Ok(());
                    }
                    let managed = self.instances.get_mut(&key).expect("checked above");
                    if let Err(err) = managed.ah_replay.check_and_update(header.seq_number) {
                        if let Error::Wire(kind) = err {
                            self.note_wire_error(key, kind);
                        }
                        return Ok(());
                    }
                    payload
                }
                Err(_) => {
                    self.note_wire_error(key, WireError::TooShort);
                    return Ok(());
                }
            }
        } else {
            &datagram.bytes
        };

        let parsed = match VrrpPacket::parse(vrrp_bytes, key.family) {
            Ok(p) => p,
            Err(Error::Wire(kind)) => {
                self.note_wire_error(key, kind);
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        if let Some(kind) = self.validate(key, &parsed, datagram.ttl_or_hop_limit, datagram.src) {
            self.note_wire_error(key, kind);
            if kind == WireError::AuthFailure {
                let managed = self.instances.get_mut(&key).expect("checked above");
                managed.instance.stats.auth_failures += 1;
            }
            return Ok(());
        }

        let managed = self.instances.get_mut(&key).expect("checked above");
        managed.instance.stats.adverts_received += 1;
        let state = managed.instance.state;

        match state {
            VrrpState::Backup => self.handle_backup_advert(key, parsed, datagram.src).await?,
            VrrpState::Master => self.handle_master_advert(key, parsed, datagram.src).await?,
            _ => {}
        }
        Ok(())
    }

    fn note_wire_error(&mut self, key: InstanceKey, kind: WireError) {
        if let Some(managed) = self.instances.get_mut(&key) {
            if managed.instance.rate_limit.should_log(kind) {
                warn!(vrid = key.vrid, ?kind, "dropping advertisement that failed validation");
            }
        }
    }

    /// Receive-side validation beyond parsing: version, TTL, v2 auth,
    /// VRID, advert-interval (v2 strict, v3 advisory — §6), checksum
    /// (with v3 checksum-compat auto-detection, §9), and (for strict mode)
    /// the advertised VIP set. Returns the first failure, or `None` if the
    /// packet is acceptable.
    fn validate(&mut self, key: InstanceKey, pkt: &VrrpPacket, ttl_or_hop_limit: u8, src: IpAddr) -> Option<WireError> {
        let managed = self.instances.get_mut(&key).expect("checked by caller");
        let config = &managed.instance.config;

        if pkt.version.as_u8() != config.version.as_u8() {
            return Some(WireError::BadVersion);
        }
        if !config.flags.unicast && ttl_or_hop_limit != VRRP_IP_TTL {
            return Some(WireError::BadTtl);
        }
        if config.version == VrrpVersion::V2 {
            if pkt.v2_auth_type != config.auth_type.wire_value() {
                return Some(WireError::AuthTypeMismatch);
            }
            if config.auth_type == AuthType::SimplePassword {
                let configured = v2_password_bytes(config.auth_password.as_deref());
                if !auth::verify_simple_password(&configured, &pkt.v2_auth_data) {
                    return Some(WireError::AuthFailure);
                }
            }
            // v2 requires advert-interval agreement; v3 only logs a
            // mismatch (carried in the 12-bit field for information, per
            // RFC 5798 §5.2.4) and never rejects on it.
            if pkt.adver_int as u64 != config.adver_int.as_secs() {
                return Some(WireError::AdverIntervalMismatch);
            }
        }
        if pkt.vrid != config.vrid {
            return Some(WireError::VridMismatch);
        }
        if !checksum_matches(config, &mut managed.checksum_compat, pkt, key.family, src) {
            return Some(WireError::BadChecksum);
        }
        if config.flags.strict_mode && pkt.addresses.len() != config.virtual_ips.len() {
            return Some(WireError::VipMismatch);
        }
        None
    }

    async fn handle_backup_advert(&mut self, key: InstanceKey, pkt: VrrpPacket, src: IpAddr) -> Result<()> {
        let managed = self.instances.get_mut(&key).expect("checked by caller");
        let remote_interval = match pkt.version {
            crate::types::VrrpVersion::V3 => Some(Duration::from_millis(pkt.adver_int as u64 * 10)),
            crate::types::VrrpVersion::V2 => Some(Duration::from_secs(pkt.adver_int as u64)),
        };
        let decision = managed.instance.decide_backup(pkt.priority, src, remote_interval);
        match decision {
            BackupDecision::AcceptAsMaster => {
                managed.down_timer_at = Instant::now() + managed.instance.down_timer();
            }
            BackupDecision::FastTakeover => {
                managed.down_timer_at = Instant::now() + managed.instance.skew();
            }
            BackupDecision::DiscardLowerPriority => {}
        }
        Ok(())
    }

    async fn handle_master_advert(&mut self, key: InstanceKey, pkt: VrrpPacket, src: IpAddr) -> Result<()> {
        let our_src = self
            .instances
            .get(&key)
            .and_then(|m| m.instance.config.saddr)
            .ok_or_else(|| Error::config("instance has no source address"))?;

        let decision = {
            let managed = self.instances.get_mut(&key).expect("checked by caller");
            managed.instance.decide_master(pkt.priority, src, our_src)
        };

        match decision {
            MasterDecision::BackOff => {
                self.transition_to_backup(key).await?;
            }
            MasterDecision::RespondToRelease => {
                self.send_advert(key).await?;
            }
            MasterDecision::AssertSuperiority { send_advert_immediately, suppress_periodic_advert } => {
                self.garp_burst(key).await?;
                if send_advert_immediately || !suppress_periodic_advert {
                    self.send_advert(key).await?;
                }
                self.notify(key, NotifyEvent::MasterRxLowerPri).await;
            }
            MasterDecision::DuplicateOwner => {
                warn!(vrid = key.vrid, %src, "duplicate address owner detected");
            }
        }
        Ok(())
    }

    async fn handle_advert_timer(&mut self, key: InstanceKey) -> Result<()> {
        let is_master = self.instances.get(&key).map(|m| m.instance.state) == Some(VrrpState::Master);
        if is_master {
            self.send_advert(key).await?;
        }
        Ok(())
    }

    async fn handle_down_timer(&mut self, key: InstanceKey) -> Result<()> {
        let is_backup = self.instances.get(&key).map(|m| m.instance.state) == Some(VrrpState::Backup);
        if is_backup {
            self.propose_master(key).await?;
        }
        Ok(())
    }

    async fn propose_master(&mut self, key: InstanceKey) -> Result<()> {
        let group_info = self.instances.get(&key).and_then(|m| m.sync_group.clone());

        let commit = match &group_info {
            Some((group_name, member_id)) => {
                let group = self
                    .sync_groups
                    .get_mut(group_name)
                    .ok_or_else(|| Error::config(format!("unknown sync group {group_name}")))?;
                let (decision, forced_masters) = group.propose(*member_id, Proposal::Master);
                if decision == crate::sync_group::Decision::Commit {
                    for member in forced_masters {
                        if let Some(other_key) = self.key_for_member(member) {
                            self.transition_to_master(other_key).await?;
                        }
                    }
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        if commit {
            self.transition_to_master(key).await?;
        }
        Ok(())
    }

    fn key_for_member(&self, member: MemberId) -> Option<InstanceKey> {
        self.instances
            .iter()
            .find(|(_, m)| m.sync_group.as_ref().map(|(_, id)| *id) == Some(member))
            .map(|(k, _)| *k)
    }

    async fn transition_to_master(&mut self, key: InstanceKey) -> Result<()> {
        {
            let managed = self.instances.get_mut(&key).expect("key must exist");
            managed.instance.transition_to_master();
        }
        self.send_advert(key).await?;
        self.apply_effects(key, true).await?;
        self.garp_burst(key).await?;
        self.notify(key, NotifyEvent::Master).await;
        Ok(())
    }

    /// Stepping down from MASTER because a higher-priority advert arrived
    /// (`MasterDecision::BackOff`): the new master is already advertising,
    /// so this instance just releases its resources and goes quiet —
    /// sending its own advert here would be a lie about current mastership.
    /// The one case that *does* get a priority-0 advert, an explicit
    /// shutdown, goes through [`Engine::stop`] instead (§4.4, §6 STOP).
    async fn transition_to_backup(&mut self, key: InstanceKey) -> Result<()> {
        self.apply_effects(key, false).await?;
        {
            let managed = self.instances.get_mut(&key).expect("key must exist");
            managed.instance.transition_to_backup();
            managed.down_timer_at = Instant::now() + managed.instance.down_timer();
        }
        self.notify(key, NotifyEvent::Backup).await;
        Ok(())
    }

    async fn apply_effects(&self, key: InstanceKey, entering_master: bool) -> Result<()> {
        let managed = self.instances.get(&key).expect("key must exist");
        let vips: Vec<(IpAddr, u8)> = managed.instance.config.virtual_ips.iter().map(|a| (*a, prefix_len_for(*a))).collect();
        let evips: Vec<(IpAddr, u8)> = managed.instance.config.excess_vips.iter().map(|a| (*a, prefix_len_for(*a))).collect();
        let resources = InstanceResources {
            interface: managed.instance.config.interface.as_deref().unwrap_or(""),
            vips: &vips,
            evips: &evips,
            routes: &managed.instance.config.virtual_routes,
            rules: &managed.instance.config.virtual_rules,
            accept_mode: managed.instance.config.flags.accept_mode,
        };
        if entering_master {
            self.effects.enter_master(&resources).await
        } else {
            self.effects.leave_master(&resources).await
        }
    }

    /// Entry burst of `garp_repeat` packets per VIP (§4.6), followed by one
    /// delayed secondary burst `garp_delay` later if configured.
    async fn garp_burst(&self, key: InstanceKey) -> Result<()> {
        let managed = self.instances.get(&key).expect("key must exist");
        let interface = managed.instance.config.interface.clone().unwrap_or_default();
        let vips = managed.instance.config.virtual_ips.clone();
        let repeat = self.defaults.garp_repeat;
        let delay = self.defaults.garp_delay;

        let sender = GarpSender::new(self.l2_backend.as_ref());
        for vip in &vips {
            sender.burst(&interface, *vip, repeat).await?;
        }

        if !delay.is_zero() {
            let backend = self.l2_backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let sender = GarpSender::new(backend.as_ref());
                for vip in vips {
                    let _ = sender.refresh_once(&interface, vip).await;
                }
            });
        }
        Ok(())
    }

    async fn send_advert(&mut self, key: InstanceKey) -> Result<()> {
        self.send_advert_with_priority(key, None).await
    }

    /// Builds and transmits one advertisement. `priority_override` forces a
    /// specific priority field (used by [`Engine::stop`] to send a
    /// priority-0 advert); otherwise the instance's current
    /// `effective_priority` is stamped.
    async fn send_advert_with_priority(&mut self, key: InstanceKey, priority_override: Option<u8>) -> Result<()> {
        let transport = match self.transports.get(&key).cloned() {
            Some(t) => t,
            None => return Ok(()),
        };

        let managed = self.instances.get_mut(&key).expect("key must exist");
        let priority = priority_override.unwrap_or_else(|| managed.instance.effective_priority());
        let version = managed.instance.config.version;
        let adver_int_field = match version {
            crate::types::VrrpVersion::V2 => managed.instance.config.adver_int.as_secs() as u16,
            crate::types::VrrpVersion::V3 => (managed.instance.config.adver_int.as_millis() / 10) as u16,
        };

        let mut pkt = VrrpPacket {
            version,
            vrid: key.vrid,
            priority,
            addresses: managed.instance.config.virtual_ips.clone(),
            adver_int: adver_int_field,
            v2_auth_type: managed.instance.config.auth_type.wire_value(),
            v2_auth_data: [0u8; VRRP_V2_AUTH_LEN],
            checksum: 0,
        };

        if version == crate::types::VrrpVersion::V2 {
            if managed.instance.config.auth_type == AuthType::SimplePassword {
                pkt.v2_auth_data = v2_password_bytes(managed.instance.config.auth_password.as_deref());
            }
            pkt.checksum = pkt.checksum_v2(key.family);
        } else if managed.instance.config.flags.v3_checksum_as_v2 {
            pkt.checksum = pkt.checksum_v2(key.family);
        } else {
            pkt.checksum = match (key.family, managed.instance.config.saddr) {
                (Family::V4, Some(IpAddr::V4(src))) => {
                    let dst = match managed.instance.config.mcast_daddr {
                        Some(IpAddr::V4(d)) => d,
                        _ => Ipv4Addr::new(224, 0, 0, 18),
                    };
                    pkt.checksum_v3(key.family, src, dst)
                }
                (Family::V6, Some(IpAddr::V6(src))) => {
                    let dst = match managed.instance.config.mcast_daddr {
                        Some(IpAddr::V6(d)) => d,
                        _ => Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12),
                    };
                    pkt.checksum_v3_ipv6(src, dst)
                }
                _ => 0,
            };
        }

        let bytes = pkt.to_bytes(key.family);

        let wire_bytes = if managed.instance.config.auth_type == AuthType::IpsecAh {
            let saddr = managed.instance.config.saddr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            let seq = managed.ah_tx_seq.next_seq_for_tx();
            let password = managed.instance.config.auth_password.clone().unwrap_or_default();
            let mut wrapped = build_ah_wrapper(password.as_bytes(), saddr, seq, &bytes);
            wrapped.extend_from_slice(&bytes);
            wrapped
        } else {
            bytes
        };

        if managed.instance.config.flags.unicast {
            for peer in managed.instance.config.unicast_peers.clone() {
                transport.send_unicast(&wire_bytes, peer).await?;
            }
        } else {
            transport.send_multicast(&wire_bytes).await?;
        }

        managed.instance.stats.adverts_sent += 1;
        Ok(())
    }

    async fn notify(&self, key: InstanceKey, event: NotifyEvent) -> NotifyOutcome {
        let managed = self.instances.get(&key).expect("key must exist");
        let config = crate::notify::NotifyConfig {
            on_backup: managed.instance.config.notify_backup.clone(),
            on_master: managed.instance.config.notify_master.clone(),
            on_fault: managed.instance.config.notify_fault.clone(),
            on_stop: managed.instance.config.notify_stop.clone(),
            fifo_path: managed.instance.config.notify_fifo.clone(),
        };
        let ctx = NotifyContext {
            instance: managed.instance.config.iname.clone(),
            group: managed.sync_group.as_ref().map(|(name, _)| name.clone()),
            event,
            priority: managed.instance.effective_priority(),
        };
        let notifier = Notifier::new(self.notifier_launcher.as_ref(), self.notifier_fifo.as_ref());
        let outcome = notifier.dispatch(&config, &ctx).await;
        if outcome.had_any_failure() {
            debug!(vrid = key.vrid, ?event, "notify dispatch reported a failure");
        }
        outcome
    }
}

/// Checksum validation with v3 checksum-compat auto-detection (§9,
/// scenario 5). Some v3 peers checksum the v2 way (plain internet
/// checksum, no pseudo-header) even though they speak v3 framing. A
/// standards-compliant peer is always accepted; a unicast peer that only
/// ever validates under the v2-style checksum is recorded as compat and
/// trusted that way from then on, so a single pseudo-header mismatch
/// doesn't get relitigated every packet.
fn checksum_matches(config: &InstanceConfig, compat: &mut HashMap<IpAddr, bool>, pkt: &VrrpPacket, family: Family, src: IpAddr) -> bool {
    if config.version == VrrpVersion::V2 {
        return pkt.checksum == pkt.checksum_v2(family);
    }

    let v2_style = pkt.checksum == pkt.checksum_v2(family);

    if config.flags.v3_checksum_as_v2 {
        return v2_style;
    }
    if let Some(&is_compat) = compat.get(&src) {
        if is_compat {
            return v2_style;
        }
    }

    let standard_ok = match (family, src) {
        (Family::V4, IpAddr::V4(src4)) => {
            let dst4 = match config.mcast_daddr {
                Some(IpAddr::V4(d)) => d,
                _ => match default_mcast_group(family) {
                    IpAddr::V4(d) => d,
                    _ => Ipv4Addr::new(224, 0, 0, 18),
                },
            };
            pkt.checksum == pkt.checksum_v3(family, src4, dst4)
        }
        (Family::V6, IpAddr::V6(src6)) => {
            let dst6 = match config.mcast_daddr {
                Some(IpAddr::V6(d)) => d,
                _ => match default_mcast_group(family) {
                    IpAddr::V6(d) => d,
                    _ => Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12),
                },
            };
            pkt.checksum == pkt.checksum_v3_ipv6(src6, dst6)
        }
        _ => false,
    };
    if standard_ok {
        compat.entry(src).or_insert(false);
        return true;
    }

    // Auto-detect: a unicast peer whose packets never validate under the
    // standard pseudo-header but do validate the v2 way is assumed to be
    // running a checksum-compat v3 stack from here on.
    if config.flags.unicast && v2_style {
        compat.insert(src, true);
        return true;
    }
    false
}

fn prefix_len_for(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Left-pads/truncates a configured password into the fixed 8-byte v2 auth
/// trailer.
fn v2_password_bytes(password: Option<&str>) -> [u8; 8] {
    let mut data = [0u8; 8];
    if let Some(password) = password {
        let bytes = password.as_bytes();
        let n = bytes.len().min(8);
        data[..n].copy_from_slice(&bytes[..n]);
    }
    data
}

/// Builds the 24-byte AH wrapper for a v2 IPSEC-AH packet: header plus ICV,
/// ready to prepend to the VRRP payload on the wire.
pub fn build_ah_wrapper(password: &[u8], src: IpAddr, seq: u32, vrrp_payload: &[u8]) -> Vec<u8> {
    let header = AhHeader {
        next_header: crate::types::VRRP_PROTOCOL,
        payload_len: 4,
        spi: auth::spi_for_source(src),
        seq_number: seq,
    };
    let icv = auth::compute_icv(password, &header, vrrp_payload);
    let mut out = Vec::with_capacity(auth::AH_HEADER_LEN + auth::AH_ICV_LEN);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&icv);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_len_matches_family() {
        assert_eq!(prefix_len_for("10.0.0.1".parse().unwrap()), 32);
        assert_eq!(prefix_len_for("fe80::1".parse().unwrap()), 128);
    }

    #[test]
    fn ah_wrapper_has_correct_length() {
        let wrapper = build_ah_wrapper(b"secret", "10.0.0.1".parse().unwrap(), 1, b"payload");
        assert_eq!(wrapper.len(), auth::AH_HEADER_LEN + auth::AH_ICV_LEN);
    }

    #[test]
    fn password_bytes_are_zero_padded() {
        let bytes = v2_password_bytes(Some("hi"));
        assert_eq!(&bytes[..2], b"hi");
        assert_eq!(&bytes[2..], &[0u8; 6]);
    }

    fn v3_config(unicast: bool, v3_checksum_as_v2: bool) -> InstanceConfig {
        use crate::config::InstanceFlags;
        use crate::types::{AuthType, Family, VrrpVersion};
        InstanceConfig {
            iname: "vi_test".to_string(),
            vrid: 7,
            family: Family::V4,
            version: VrrpVersion::V3,
            interface: Some("eth0".to_string()),
            base_priority: 100,
            adver_int: Duration::from_secs(1),
            down_timer_adverts: 3,
            virtual_ips: vec!["10.0.0.1".parse().unwrap()],
            excess_vips: vec![],
            saddr: Some("10.0.0.2".parse().unwrap()),
            mcast_daddr: Some("224.0.0.18".parse().unwrap()),
            unicast_peers: vec!["10.0.0.3".parse().unwrap()],
            flags: InstanceFlags { unicast, v3_checksum_as_v2, ..Default::default() },
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

    fn v3_pkt(checksum: u16) -> VrrpPacket {
        VrrpPacket {
            version: crate::types::VrrpVersion::V3,
            vrid: 7,
            priority: 100,
            addresses: vec!["10.0.0.1".parse().unwrap()],
            adver_int: 100,
            v2_auth_type: 0,
            v2_auth_data: [0u8; VRRP_V2_AUTH_LEN],
            checksum,
        }
    }

    #[test]
    fn checksum_matches_accepts_standard_v3_pseudo_header() {
        let config = v3_config(false, false);
        let src: IpAddr = "10.0.0.3".parse().unwrap();
        let mut pkt = v3_pkt(0);
        pkt.checksum = pkt.checksum_v3(Family::V4, "10.0.0.3".parse().unwrap(), "224.0.0.18".parse().unwrap());
        let mut compat = HashMap::new();
        assert!(checksum_matches(&config, &mut compat, &pkt, Family::V4, src));
        assert_eq!(compat.get(&src), Some(&false));
    }

    #[test]
    fn checksum_matches_auto_detects_unicast_v2_style_compat_peer() {
        let config = v3_config(true, false);
        let src: IpAddr = "10.0.0.3".parse().unwrap();
        let mut pkt = v3_pkt(0);
        pkt.checksum = pkt.checksum_v2(Family::V4);
        let mut compat = HashMap::new();
        assert!(checksum_matches(&config, &mut compat, &pkt, Family::V4, src));
        assert_eq!(compat.get(&src), Some(&true));

        // Second packet from the same peer is trusted via the recorded
        // compat state without needing to fail the standard check again.
        assert!(checksum_matches(&config, &mut compat, &pkt, Family::V4, src));
    }

    #[test]
    fn checksum_matches_rejects_multicast_peer_with_v2_style_checksum() {
        let config = v3_config(false, false);
        let src: IpAddr = "10.0.0.3".parse().unwrap();
        let mut pkt = v3_pkt(0);
        pkt.checksum = pkt.checksum_v2(Family::V4);
        let mut compat = HashMap::new();
        // Not unicast, so auto-detection never engages: a multicast peer
        // must get the pseudo-header checksum right.
        assert!(!checksum_matches(&config, &mut compat, &pkt, Family::V4, src));
    }

    #[test]
    fn checksum_matches_honors_explicit_v3_checksum_as_v2_override() {
        let config = v3_config(false, true);
        let src: IpAddr = "10.0.0.3".parse().unwrap();
        let mut pkt = v3_pkt(0);
        pkt.checksum = pkt.checksum_v2(Family::V4);
        let mut compat = HashMap::new();
        assert!(checksum_matches(&config, &mut compat, &pkt, Family::V4, src));
    }
}
