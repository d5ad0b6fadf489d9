//! Gratuitous ARP (IPv4) and unsolicited Neighbor Advertisement (IPv6)
//! bursts (§4.6). These refresh L2 caches on the LAN after a failover so
//! traffic for a VIP reaches the new MASTER without waiting on ARP/ND
//! timeouts.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::Result;

/// Seam for actually emitting an L2 cache-refresh frame for one address on
/// one interface. Production implementation is a non-goal (it needs a raw
/// AF_PACKET socket); only the scheduling logic in this module is core.
#[async_trait]
pub trait L2AnnounceBackend: Send + Sync {
    async fn announce(&self, interface: &str, addr: IpAddr) -> Result<()>;
}

/// Parameters for one VIP's GARP/NA schedule, taken from [`crate::config::GlobalDefaults`].
#[derive(Debug, Clone, Copy)]
pub struct GarpSchedule {
    pub repeat: u32,
    pub delay: Duration,
    pub refresh: Duration,
}

/// Runs the burst/secondary-burst/periodic-refresh sequence of §4.6 for one
/// VIP on one interface, using whatever clock/sleep primitive the caller
/// provides (kept generic so tests can use a virtual clock instead of
/// `tokio::time`).
pub struct GarpSender<'a> {
    backend: &'a dyn L2AnnounceBackend,
}

impl<'a> GarpSender<'a> {
    pub fn new(backend: &'a dyn L2AnnounceBackend) -> Self {
        Self { backend }
    }

    /// Entry burst: `repeat` announcements back to back, immediately on
    /// becoming MASTER.
    pub async fn burst(&self, interface: &str, addr: IpAddr, repeat: u32) -> Result<()> {
        for _ in 0..repeat.max(1) {
            self.backend.announce(interface, addr).await?;
        }
        Ok(())
    }

    /// One refresh announcement, used both for the post-`garp_delay`
    /// secondary burst and for the periodic `garp_refresh` tick while
    /// remaining MASTER.
    pub async fn refresh_once(&self, interface: &str, addr: IpAddr) -> Result<()> {
        self.backend.announce(interface, addr).await
    }
}

/// VMAC sub-interfaces that are *not* our primary still need periodic
/// refreshes (`vmac_garp_intvl`) to keep neighbours' caches pointed at the
/// right L2 endpoint — see §4.6.
pub fn secondary_vmac_refresh_due(elapsed_since_last: Duration, vmac_garp_intvl: Duration) -> bool {
    vmac_garp_intvl > Duration::ZERO && elapsed_since_last >= vmac_garp_intvl
}
