//! End-to-end scenarios driving two or three [`Engine`]s against each other
//! over the in-memory transport bus, exercising election, preemption, AH
//! authentication, and sync-group fault propagation without any raw sockets.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use vrrp::config::{GlobalDefaults, InstanceConfig, InstanceFlags};
use vrrp::effects::{test_double::RecordingBackend, Backends, EffectExecutor};
use vrrp::engine::{Engine, EngineEvent, InstanceKey, ManagedInstance};
use vrrp::garp::L2AnnounceBackend;
use vrrp::notify::{FifoWriter, ProcessLauncher};
use vrrp::socket::test_double::MemoryBus;
use vrrp::types::{AuthType, Family, VrrpState, VrrpVersion};
use vrrp::VrrpInstance;

struct NoopProcessLauncher;
#[async_trait]
impl ProcessLauncher for NoopProcessLauncher {
    async fn spawn(&self, _command: &str, _env: &std::collections::HashMap<String, String>) -> std::io::Result<()> {
        Ok(())
    }
}

struct NoopFifoWriter;
#[async_trait]
impl FifoWriter for NoopFifoWriter {
    async fn write_line(&self, _path: &str, _line: &str) -> std::io::Result<()> {
        Ok(())
    }
}

struct NoopL2Backend;
#[async_trait]
impl L2AnnounceBackend for NoopL2Backend {
    async fn announce(&self, _interface: &str, _addr: IpAddr) -> vrrp::Result<()> {
        Ok(())
    }
}

fn make_engine() -> Engine {
    let rec = RecordingBackend::new();
    let executor = EffectExecutor::new(Backends {
        vip: Box::new(rec.clone()),
        route: Box::new(rec.clone()),
        rule: Box::new(rec.clone()),
        firewall: Box::new(rec.clone()),
        netlink: Box::new(rec),
    });
    Engine::new(
        Arc::new(executor),
        Arc::new(NoopProcessLauncher),
        Arc::new(NoopFifoWriter),
        Arc::new(NoopL2Backend),
        GlobalDefaults::default(),
    )
}

fn config(vrid: u8, priority: u8, saddr: &str, nopreempt: bool) -> InstanceConfig {
    let defaults = GlobalDefaults::default();
    InstanceConfig {
        iname: format!("vi_{vrid}"),
        vrid,
        family: Family::V4,
        version: VrrpVersion::V3,
        interface: Some("eth0".to_string()),
        base_priority: priority,
        adver_int: Duration::from_millis(50),
        down_timer_adverts: 3,
        virtual_ips: vec!["10.0.0.100".parse().unwrap()],
        excess_vips: vec![],
        saddr: Some(saddr.parse().unwrap()),
        mcast_daddr: Some(defaults.vrrp_mcast_group4),
        unicast_peers: vec![],
        flags: InstanceFlags { nopreempt, ..Default::default() },
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

/// Registers one instance on a fresh join to `bus`, already past INIT.
async fn join_instance(engine: &mut Engine, bus: &Arc<MemoryBus>, key: InstanceKey, addr: IpAddr, cfg: InstanceConfig) {
    let mut instance = VrrpInstance::complete_instance(cfg);
    instance.state = instance.initial_state();
    let transport = Arc::new(bus.join(addr).await);
    engine.register_instance(key, ManagedInstance::new(instance, None, Instant::now()), transport);
}

#[tokio::test]
async fn backup_accepts_higher_priority_advert_and_stays_backup() {
    let bus = MemoryBus::new();
    let key = InstanceKey { family: Family::V4, vrid: 1 };

    let mut master_engine = make_engine();
    join_instance(&mut master_engine, &bus, key, "10.0.0.1".parse().unwrap(), config(1, 200, "10.0.0.1", false)).await;
    assert_eq!(master_engine.state_of(key), Some(VrrpState::Backup));
    master_engine.event_sender().send(EngineEvent::DownTimerFired { key }).unwrap();
    master_engine.run_once().await.unwrap();
    assert_eq!(master_engine.state_of(key), Some(VrrpState::Master));

    let mut backup_engine = make_engine();
    join_instance(&mut backup_engine, &bus, key, "10.0.0.2".parse().unwrap(), config(1, 100, "10.0.0.2", false)).await;
    backup_engine.spawn_readers();

    assert_eq!(backup_engine.state_of(key), Some(VrrpState::Backup));

    master_engine.event_sender().send(EngineEvent::AdvertTimerFired { key }).unwrap();
    master_engine.run_once().await.unwrap();
    assert_eq!(master_engine.stats_of(key).unwrap().adverts_sent, 2);

    backup_engine.run_once().await.unwrap();
    assert_eq!(backup_engine.stats_of(key).unwrap().adverts_received, 1);
    // Still BACKUP: the advert outranks it, so it just reset the down-timer.
    assert_eq!(backup_engine.state_of(key), Some(VrrpState::Backup));
}

#[tokio::test]
async fn backup_takes_over_once_its_own_down_timer_fires() {
    let bus = MemoryBus::new();
    let key = InstanceKey { family: Family::V4, vrid: 2 };

    let mut engine = make_engine();
    join_instance(&mut engine, &bus, key, "10.0.1.1".parse().unwrap(), config(2, 100, "10.0.1.1", false)).await;
    assert_eq!(engine.state_of(key), Some(VrrpState::Backup));

    engine.event_sender().send(EngineEvent::DownTimerFired { key }).unwrap();
    engine.run_once().await.unwrap();

    assert_eq!(engine.state_of(key), Some(VrrpState::Master));
    assert_eq!(engine.stats_of(key).unwrap().adverts_sent, 1);
}

#[tokio::test]
async fn master_backs_off_to_a_higher_priority_sender() {
    let bus = MemoryBus::new();
    let key = InstanceKey { family: Family::V4, vrid: 3 };

    let mut weak_engine = make_engine();
    join_instance(&mut weak_engine, &bus, key, "10.0.2.1".parse().unwrap(), config(3, 100, "10.0.2.1", false)).await;
    weak_engine.event_sender().send(EngineEvent::DownTimerFired { key }).unwrap();
    weak_engine.run_once().await.unwrap();
    assert_eq!(weak_engine.state_of(key), Some(VrrpState::Master));
    weak_engine.spawn_readers();

    let mut strong_engine = make_engine();
    join_instance(&mut strong_engine, &bus, key, "10.0.2.2".parse().unwrap(), config(3, 200, "10.0.2.2", false)).await;
    strong_engine.event_sender().send(EngineEvent::DownTimerFired { key }).unwrap();
    strong_engine.run_once().await.unwrap();
    assert_eq!(strong_engine.state_of(key), Some(VrrpState::Master));

    // The weak master receives the strong one's advert and steps down.
    weak_engine.run_once().await.unwrap();
    assert_eq!(weak_engine.state_of(key), Some(VrrpState::Backup));
}

#[tokio::test]
async fn nopreempt_keeps_a_lower_priority_master_in_place() {
    let bus = MemoryBus::new();
    let key = InstanceKey { family: Family::V4, vrid: 4 };

    let mut weak_engine = make_engine();
    join_instance(&mut weak_engine, &bus, key, "10.0.3.1".parse().unwrap(), config(4, 100, "10.0.3.1", false)).await;
    weak_engine.event_sender().send(EngineEvent::DownTimerFired { key }).unwrap();
    weak_engine.run_once().await.unwrap();
    assert_eq!(weak_engine.state_of(key), Some(VrrpState::Master));

    let mut strong_engine = make_engine();
    join_instance(&mut strong_engine, &bus, key, "10.0.3.2".parse().unwrap(), config(4, 200, "10.0.3.2", true)).await;
    strong_engine.spawn_readers();
    assert_eq!(strong_engine.state_of(key), Some(VrrpState::Backup));

    weak_engine.event_sender().send(EngineEvent::AdvertTimerFired { key }).unwrap();
    weak_engine.run_once().await.unwrap();

    strong_engine.run_once().await.unwrap();
    // nopreempt: a higher-priority BACKUP still accepts the existing
    // lower-priority master's advert instead of contesting mastership.
    assert_eq!(strong_engine.state_of(key), Some(VrrpState::Backup));
}

#[tokio::test]
async fn ah_authenticated_advert_round_trips_through_build_and_verify() {
    use vrrp::auth::{self, AhHeader};
    use vrrp::build_ah_wrapper;
    use vrrp::VrrpPacket;

    let mut pkt = VrrpPacket {
        version: VrrpVersion::V2,
        vrid: 9,
        priority: 100,
        addresses: vec!["10.0.4.100".parse().unwrap()],
        adver_int: 1,
        v2_auth_type: AuthType::IpsecAh.wire_value(),
        v2_auth_data: [0u8; 8],
        checksum: 0,
    };
    pkt.checksum = pkt.checksum_v2(Family::V4);
    let payload = pkt.to_bytes(Family::V4);

    let src: IpAddr = "10.0.4.1".parse().unwrap();
    let wrapper = build_ah_wrapper(b"secret123", src, 1, &payload);

    let mut wire = wrapper.clone();
    wire.extend_from_slice(&payload);

    let (header, icv) = AhHeader::parse(&wire).unwrap();
    assert_eq!(header.spi, auth::spi_for_source(src));
    let body = &wire[auth::AH_HEADER_LEN + auth::AH_ICV_LEN..];
    assert!(auth::verify_icv(b"secret123", &header, body, icv));
    assert!(!auth::verify_icv(b"wrongpass", &header, body, icv));
}

#[tokio::test]
async fn sync_group_propagates_fault_to_all_members() {
    use vrrp::sync_group::{Decision, MemberId, Proposal, SyncGroup};

    let mut group = SyncGroup::new("vg_1", vec![MemberId(0), MemberId(1), MemberId(2)], false);
    let (decision, forced) = group.propose(MemberId(0), Proposal::Fault);
    assert_eq!(decision, Decision::Commit);
    assert_eq!(forced.len(), 2);
    assert_eq!(group.num_member_fault(), 3);
}

#[tokio::test]
async fn memory_bus_round_trips_a_full_v3_advertisement() {
    use vrrp::socket::VrrpTransport;

    let bus = MemoryBus::new();
    let a: IpAddr = "10.0.5.1".parse().unwrap();
    let b: IpAddr = "10.0.5.2".parse().unwrap();
    let transport_a = bus.join(a).await;
    let transport_b = bus.join(b).await;

    let mut pkt = vrrp::VrrpPacket {
        version: VrrpVersion::V3,
        vrid: 11,
        priority: 200,
        addresses: vec!["10.0.5.100".parse().unwrap()],
        adver_int: 100,
        v2_auth_type: 0,
        v2_auth_data: [0u8; 8],
        checksum: 0,
    };
    pkt.checksum = pkt.checksum_v3(Family::V4, "10.0.5.1".parse().unwrap(), "224.0.0.18".parse().unwrap());
    let bytes = pkt.to_bytes(Family::V4);

    transport_a.send_multicast(&bytes).await.unwrap();
    let received = transport_b.recv().await.unwrap();

    let parsed = vrrp::VrrpPacket::parse(&received.bytes, Family::V4).unwrap();
    assert_eq!(parsed.vrid, 11);
    assert_eq!(parsed.priority, 200);
    assert_eq!(received.src, a);
}
