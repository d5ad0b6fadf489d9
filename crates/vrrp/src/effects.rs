//! Effect plumbing (§4.6): the deterministic command sequences a state
//! transition produces, and the backend trait seams those commands are
//! issued against. Netlink and firewall backends are non-goals; this module
//! only defines the seam and an in-memory double fully implementing it, so
//! the state machine can be driven and asserted on without root.

use async_trait::async_trait;
use std::net::IpAddr;

use crate::config::{VirtualRouteConfig, VirtualRuleConfig};
use crate::error::Result;

/// Installs and removes virtual IP addresses on an interface.
#[async_trait]
pub trait VipBackend: Send + Sync {
    async fn add_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> Result<()>;
    async fn remove_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> Result<()>;
}

/// Installs and removes the virtual routes a MASTER instance owns.
#[async_trait]
pub trait RouteBackend: Send + Sync {
    async fn add_route(&self, route: &VirtualRouteConfig) -> Result<()>;
    async fn remove_route(&self, route: &VirtualRouteConfig) -> Result<()>;
}

/// Installs and removes the policy-routing rules a MASTER instance owns.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    async fn add_rule(&self, rule: &VirtualRuleConfig) -> Result<()>;
    async fn remove_rule(&self, rule: &VirtualRuleConfig) -> Result<()>;
}

/// Installs and removes the accept-mode firewall rule for one VIP, indexed
/// by `(family, address)` by the backend so reference counting is correct
/// when multiple instances share a VIP across families (§5 Shared resources).
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn add_accept(&self, addr: IpAddr) -> Result<()>;
    async fn remove_accept(&self, addr: IpAddr) -> Result<()>;
}

/// A single netlink-visible change fed back into the tracking engine (§6
/// "Netlink feed"). The core only consumes this stream; producing it from a
/// real netlink socket is a non-goal.
#[derive(Debug, Clone)]
pub enum NetlinkEvent {
    LinkUp(String),
    LinkDown(String),
    AddressAdded { interface: String, addr: IpAddr },
    AddressRemoved { interface: String, addr: IpAddr },
    RouteAdded(RouteKey),
    RouteRemoved(RouteKey),
}

/// Minimal key identifying a route for netlink-event matching, independent
/// of the full config shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    pub destination: IpAddr,
    pub prefix_len: u8,
}

/// Read-only confirmation point: after issuing adds, the entering-MASTER
/// sequence polls this backend to confirm the kernel applied them before
/// the GARP burst fires (§4.6 "poll netlink for apply confirmation").
#[async_trait]
pub trait NetlinkBackend: Send + Sync {
    async fn poll_applied(&self, interface: &str, addr: IpAddr) -> Result<bool>;
}

#[async_trait]
impl<T: VipBackend + ?Sized> VipBackend for std::sync::Arc<T> {
    async fn add_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        (**self).add_vip(interface, addr, prefix_len).await
    }
    async fn remove_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        (**self).remove_vip(interface, addr, prefix_len).await
    }
}

#[async_trait]
impl<T: RouteBackend + ?Sized> RouteBackend for std::sync::Arc<T> {
    async fn add_route(&self, route: &VirtualRouteConfig) -> Result<()> {
        (**self).add_route(route).await
    }
    async fn remove_route(&self, route: &VirtualRouteConfig) -> Result<()> {
        (**self).remove_route(route).await
    }
}

#[async_trait]
impl<T: RuleBackend + ?Sized> RuleBackend for std::sync::Arc<T> {
    async fn add_rule(&self, rule: &VirtualRuleConfig) -> Result<()> {
        (**self).add_rule(rule).await
    }
    async fn remove_rule(&self, rule: &VirtualRuleConfig) -> Result<()> {
        (**self).remove_rule(rule).await
    }
}

#[async_trait]
impl<T: FirewallBackend + ?Sized> FirewallBackend for std::sync::Arc<T> {
    async fn add_accept(&self, addr: IpAddr) -> Result<()> {
        (**self).add_accept(addr).await
    }
    async fn remove_accept(&self, addr: IpAddr) -> Result<()> {
        (**self).remove_accept(addr).await
    }
}

#[async_trait]
impl<T: NetlinkBackend + ?Sized> NetlinkBackend for std::sync::Arc<T> {
    async fn poll_applied(&self, interface: &str, addr: IpAddr) -> Result<bool> {
        (**self).poll_applied(interface, addr).await
    }
}

/// Bundles the four backend seams an [`EffectExecutor`] drives.
pub struct Backends {
    pub vip: Box<dyn VipBackend>,
    pub route: Box<dyn RouteBackend>,
    pub rule: Box<dyn RuleBackend>,
    pub firewall: Box<dyn FirewallBackend>,
    pub netlink: Box<dyn NetlinkBackend>,
}

/// One instance's addresses and routed resources, enough to run the
/// entering/leaving-MASTER sequences without reaching back into
/// [`crate::instance::VrrpInstance`].
pub struct InstanceResources<'a> {
    pub interface: &'a str,
    pub vips: &'a [(IpAddr, u8)],
    pub evips: &'a [(IpAddr, u8)],
    pub routes: &'a [VirtualRouteConfig],
    pub rules: &'a [VirtualRuleConfig],
    pub accept_mode: bool,
}

/// Runs the exact ordered command sequences of §4.6.
pub struct EffectExecutor {
    backends: Backends,
}

impl EffectExecutor {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    /// Entering MASTER: firewall-accept-add (unless accept-mode) → VIPs add
    /// → eVIPs add → vroutes add → vrules add → poll netlink → (GARP burst
    /// is triggered by the caller, not this executor — it belongs to
    /// [`crate::garp`]).
    pub async fn enter_master(&self, res: &InstanceResources<'_>) -> Result<()> {
        if !res.accept_mode {
            for (addr, _) in res.vips.iter().chain(res.evips.iter()) {
                self.backends.firewall.add_accept(*addr).await?;
            }
        }
        for (addr, prefix_len) in res.vips {
            self.backends.vip.add_vip(res.interface, *addr, *prefix_len).await?;
        }
        for (addr, prefix_len) in res.evips {
            self.backends.vip.add_vip(res.interface, *addr, *prefix_len).await?;
        }
        for route in res.routes {
            self.backends.route.add_route(route).await?;
        }
        for rule in res.rules {
            self.backends.rule.add_rule(rule).await?;
        }
        for (addr, _) in res.vips.iter().chain(res.evips.iter()) {
            self.backends.netlink.poll_applied(res.interface, *addr).await?;
        }
        Ok(())
    }

    /// Leaving MASTER: vrules del → vroutes del → VIPs del → eVIPs del →
    /// firewall-accept-del. Delayed-GARP cancellation is the caller's
    /// concern (it owns the timer handle).
    pub async fn leave_master(&self, res: &InstanceResources<'_>) -> Result<()> {
        for rule in res.rules {
            self.backends.rule.remove_rule(rule).await?;
        }
        for route in res.routes {
            self.backends.route.remove_route(route).await?;
        }
        for (addr, prefix_len) in res.vips {
            self.backends.vip.remove_vip(res.interface, *addr, *prefix_len).await?;
        }
        for (addr, prefix_len) in res.evips {
            self.backends.vip.remove_vip(res.interface, *addr, *prefix_len).await?;
        }
        if !res.accept_mode {
            for (addr, _) in res.vips.iter().chain(res.evips.iter()) {
                self.backends.firewall.remove_accept(*addr).await?;
            }
        }
        Ok(())
    }
}

/// In-memory backend doubles recording every call, for assertions in tests
/// that exercise the executor without a kernel.
pub mod test_double {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Recorded {
        AddVip(String, IpAddr, u8),
        RemoveVip(String, IpAddr, u8),
        AddRoute(IpAddr, u8),
        RemoveRoute(IpAddr, u8),
        AddRule(u32),
        RemoveRule(u32),
        AddAccept(IpAddr),
        RemoveAccept(IpAddr),
    }

    #[derive(Default)]
    pub struct RecordingBackend {
        pub calls: Mutex<Vec<Recorded>>,
    }

    impl RecordingBackend {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl VipBackend for RecordingBackend {
        async fn add_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
            self.calls.lock().await.push(Recorded::AddVip(interface.to_string(), addr, prefix_len));
            Ok(())
        }
        async fn remove_vip(&self, interface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
            self.calls.lock().await.push(Recorded::RemoveVip(interface.to_string(), addr, prefix_len));
            Ok(())
        }
    }

    #[async_trait]
    impl RouteBackend for RecordingBackend {
        async fn add_route(&self, route: &VirtualRouteConfig) -> Result<()> {
            self.calls.lock().await.push(Recorded::AddRoute(route.destination, route.prefix_len));
            Ok(())
        }
        async fn remove_route(&self, route: &VirtualRouteConfig) -> Result<()> {
            self.calls.lock().await.push(Recorded::RemoveRoute(route.destination, route.prefix_len));
            Ok(())
        }
    }

    #[async_trait]
    impl RuleBackend for RecordingBackend {
        async fn add_rule(&self, rule: &VirtualRuleConfig) -> Result<()> {
            self.calls.lock().await.push(Recorded::AddRule(rule.table));
            Ok(())
        }
        async fn remove_rule(&self, rule: &VirtualRuleConfig) -> Result<()> {
            self.calls.lock().await.push(Recorded::RemoveRule(rule.table));
            Ok(())
        }
    }

    #[async_trait]
    impl FirewallBackend for RecordingBackend {
        async fn add_accept(&self, addr: IpAddr) -> Result<()> {
            self.calls.lock().await.push(Recorded::AddAccept(addr));
            Ok(())
        }
        async fn remove_accept(&self, addr: IpAddr) -> Result<()> {
            self.calls.lock().await.push(Recorded::RemoveAccept(addr));
            Ok(())
        }
    }

    #[async_trait]
    impl NetlinkBackend for RecordingBackend {
        async fn poll_applied(&self, _interface: &str, _addr: IpAddr) -> Result<bool> {
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_double::{Recorded, RecordingBackend};

    fn backends(rec: std::sync::Arc<RecordingBackend>) -> Backends {
        Backends {
            vip: Box::new(rec.clone()),
            route: Box::new(rec.clone()),
            rule: Box::new(rec.clone()),
            firewall: Box::new(rec.clone()),
            netlink: Box::new(rec),
        }
    }

    #[tokio::test]
    async fn enter_master_issues_commands_in_spec_order() {
        let rec = RecordingBackend::new();
        let executor = EffectExecutor::new(backends(rec.clone()));

        let vips = vec![("10.0.0.1".parse().unwrap(), 32)];
        let resources = InstanceResources {
            interface: "eth0",
            vips: &vips,
            evips: &[],
            routes: &[],
            rules: &[],
            accept_mode: false,
        };

        executor.enter_master(&resources).await.unwrap();

        let calls = rec.calls.lock().await;
        assert_eq!(
            *calls,
            vec![
                Recorded::AddAccept("10.0.0.1".parse().unwrap()),
                Recorded::AddVip("eth0".to_string(), "10.0.0.1".parse().unwrap(), 32),
            ]
        );
    }

    #[tokio::test]
    async fn accept_mode_skips_firewall_commands() {
        let rec = RecordingBackend::new();
        let executor = EffectExecutor::new(backends(rec.clone()));

        let vips = vec![("10.0.0.1".parse().unwrap(), 32)];
        let resources = InstanceResources {
            interface: "eth0",
            vips: &vips,
            evips: &[],
            routes: &[],
            rules: &[],
            accept_mode: true,
        };

        executor.enter_master(&resources).await.unwrap();

        let calls = rec.calls.lock().await;
        assert!(calls.iter().all(|c| !matches!(c, Recorded::AddAccept(_))));
    }

    #[tokio::test]
    async fn leave_master_reverses_order() {
        let rec = RecordingBackend::new();
        let executor = EffectExecutor::new(backends(rec.clone()));

        let vips = vec![("10.0.0.1".parse().unwrap(), 32)];
        let resources = InstanceResources {
            interface: "eth0",
            vips: &vips,
            evips: &[],
            routes: &[],
            rules: &[],
            accept_mode: false,
        };

        executor.leave_master(&resources).await.unwrap();

        let calls = rec.calls.lock().await;
        assert_eq!(
            *calls,
            vec![
                Recorded::RemoveVip("eth0".to_string(), "10.0.0.1".parse().unwrap(), 32),
                Recorded::RemoveAccept("10.0.0.1".parse().unwrap()),
            ]
        );
    }
}
