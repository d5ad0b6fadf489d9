//! Simple VRRP example: runs one instance over the loopback interface.
//!
//! Usage:
//!   sudo target/release/examples/simple_vrrp [priority]
//!
//! Or with capabilities:
//!   sudo setcap cap_net_raw+ep target/release/examples/simple_vrrp
//!   target/release/examples/simple_vrrp [priority]

use std::env;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal;
use tokio::time::{interval, Instant};
use tracing::info;

use vrrp::config::{GlobalDefaults, InstanceConfig, InstanceFlags};
use vrrp::effects::{Backends, EffectExecutor, FirewallBackend, NetlinkBackend, RouteBackend, RuleBackend, VipBackend};
use vrrp::engine::{Engine, EngineEvent, InstanceKey, ManagedInstance};
use vrrp::garp::L2AnnounceBackend;
use vrrp::notify::{FifoWriter, ProcessLauncher};
use vrrp::socket::{interface_index, RawSocketTransport};
use vrrp::types::{AuthType, Family, VrrpVersion};
use vrrp::VrrpInstance;

/// Logs every effect instead of touching the kernel; a production embedder
/// swaps this for a netlink/nftables-backed implementation.
struct LoggingBackend;

#[async_trait]
impl VipBackend for LoggingBackend {
    async fn add_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> vrrp::Result<()> {
        info!(interface, %addr, prefix_len, "add vip");
        Ok(())
    }
    async fn remove_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> vrrp::Result<()> {
        info!(interface, %addr, prefix_len, "remove vip");
        Ok(())
    }
}

#[async_trait]
impl RouteBackend for LoggingBackend {
    async fn add_route(&self, route: &vrrp::config::VirtualRouteConfig) -> vrrp::Result<()> {
        info!(?route, "add route");
        Ok(())
    }
    async fn remove_route(&self, route: &vrrp::config::VirtualRouteConfig) -> vrrp::Result<()> {
        info!(?route, "remove route");
        Ok(())
    }
}

#[async_trait]
impl RuleBackend for LoggingBackend {
    async fn add_rule(&self, rule: &vrrp::config::VirtualRuleConfig) -> vrrp::Result<()> {
        info!(?rule, "add rule");
        Ok(())
    }
    async fn remove_rule(&self, rule: &vrrp::config::VirtualRuleConfig) -> vrrp::Result<()> {
        info!(?rule, "remove rule");
        Ok(())
    }
}

#[async_trait]
impl FirewallBackend for LoggingBackend {
    async fn add_accept(&self, addr: IpAddr) -> vrrp::Result<()> {
        info!(%addr, "add firewall accept");
        Ok(())
    }
    async fn remove_accept(&self, addr: IpAddr) -> vrrp::Result<()> {
        info!(%addr, "remove firewall accept");
        Ok(())
    }
}

#[async_trait]
impl NetlinkBackend for LoggingBackend {
    async fn poll_applied(&self, _interface: &str, _addr: IpAddr) -> vrrp::Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl L2AnnounceBackend for LoggingBackend {
    async fn announce(&self, interface: &str, addr: IpAddr) -> vrrp::Result<()> {
        info!(interface, %addr, "gratuitous ARP / unsolicited NA");
        Ok(())
    }
}

#[async_trait]
impl ProcessLauncher for LoggingBackend {
    async fn spawn(&self, command: &str, _env: &std::collections::HashMap<String, String>) -> std::io::Result<()> {
        info!(command, "notify script (not actually run in this example)");
        Ok(())
    }
}

#[async_trait]
impl FifoWriter for LoggingBackend {
    async fn write_line(&self, path: &str, line: &str) -> std::io::Result<()> {
        info!(path, line, "notify fifo (not actually written in this example)");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("vrrp=info").init();

    let args: Vec<String> = env::args().collect();
    let priority: u8 = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(100);

    info!(priority, "starting VRRP example node on lo, vrid 1, VIP 127.0.10.1");

    let defaults = GlobalDefaults::default();
    let config = InstanceConfig {
        iname: "vi_1".to_string(),
        vrid: 1,
        family: Family::V4,
        version: VrrpVersion::V3,
        interface: Some("lo".to_string()),
        base_priority: priority,
        adver_int: Duration::from_secs(1),
        down_timer_adverts: 3,
        virtual_ips: vec!["127.0.10.1".parse()?],
        excess_vips: vec![],
        saddr: Some("127.0.0.1".parse()?),
        mcast_daddr: Some(defaults.vrrp_mcast_group4),
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
    };

    let key = InstanceKey { family: config.family, vrid: config.vrid };
    let mut instance = VrrpInstance::complete_instance(config);
    instance.state = instance.initial_state();

    let backend = Arc::new(LoggingBackend);
    let effects = Arc::new(EffectExecutor::new(Backends {
        vip: Box::new(LoggingBackend),
        route: Box::new(LoggingBackend),
        rule: Box::new(LoggingBackend),
        firewall: Box::new(LoggingBackend),
        netlink: Box::new(LoggingBackend),
    }));

    let ifindex = interface_index("lo")?;
    let transport = Arc::new(RawSocketTransport::new(
        ifindex,
        Family::V4,
        "224.0.0.18".parse()?,
        false,
        vrrp::types::VRRP_IP_TTL,
    )?);
    transport.join_multicast()?;

    let mut engine = Engine::new(effects, backend.clone(), backend.clone(), backend, defaults);
    let now = Instant::now();
    engine.register_instance(key, ManagedInstance::new(instance, None, now), transport);
    engine.spawn_readers();

    let sender = engine.event_sender();
    let advert_sender = sender.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let _ = advert_sender.send(EngineEvent::AdvertTimerFired { key });
        }
    });
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            let _ = sender.send(EngineEvent::DownTimerFired { key });
        }
    });

    let run_handle = tokio::spawn(async move {
        loop {
            if let Err(err) = engine.run_once().await {
                eprintln!("VRRP engine error: {err}");
            }
        }
    });

    info!("press Ctrl+C to stop");
    signal::ctrl_c().await?;
    run_handle.abort();

    Ok(())
}
