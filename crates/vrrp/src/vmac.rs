//! VMAC / IPVLAN sub-interface manager (§4.7).
//!
//! Creating the actual netlink link is a non-goal — see [`VmacBackend`] —
//! but naming, MAC derivation, and adoption-vs-creation decisions are core
//! and fully implemented here.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Family;

/// RFC 5798 §7.3 virtual MAC: `00:00:5E:00:0{1|2}:{VRID}`.
pub fn derive_vmac(vrid: u8, family: Family) -> [u8; 6] {
    let family_octet = match family {
        Family::V4 => 0x01,
        Family::V6 => 0x02,
    };
    [0x00, 0x00, 0x5E, 0x00, family_octet, vrid]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubInterfaceMode {
    /// Private-mode macvlan carrying the RFC-mandated virtual MAC.
    Vmac,
    /// L2-mode ipvlan; IPv4 requires an explicit source IP.
    Ipvlan { bridge: bool },
}

#[derive(Debug, Clone)]
pub struct SubInterfaceSpec {
    pub name: String,
    pub base_interface: String,
    pub mode: SubInterfaceMode,
    pub mac: Option<[u8; 6]>,
}

/// Seam for the actual netlink link-add/link-del calls. A kernel-backed
/// implementation is intentionally left out of scope.
#[async_trait]
pub trait VmacBackend: Send + Sync {
    async fn link_exists(&self, name: &str) -> Result<bool>;
    /// For a name that already exists, whether it's a compatible sub-link
    /// from a prior run of this instance (adopt) vs. something unrelated
    /// occupying the name (skip to the next candidate).
    async fn is_adoptable(&self, name: &str) -> Result<bool>;
    async fn create_link(&self, spec: &SubInterfaceSpec) -> Result<()>;
    async fn delete_link(&self, name: &str) -> Result<()>;
}

/// Picks a sub-interface name, preferring the adoption of an existing
/// compatible one across reloads (§4.7 "Existing compatible sub-interfaces
/// are adopted ... instead of re-created") and otherwise minting
/// `<prefix>.<vrid>`, growing to `<prefix><n>.<vrid>` on collision.
pub struct VmacManager<'a> {
    backend: &'a dyn VmacBackend,
}

impl<'a> VmacManager<'a> {
    pub fn new(backend: &'a dyn VmacBackend) -> Self {
        Self { backend }
    }

    pub fn candidate_names(prefix: &str, vrid: u8) -> impl Iterator<Item = String> + '_ {
        std::iter::once(format!("{prefix}.{vrid}")).chain((1..).map(move |n| format!("{prefix}{n}.{vrid}")))
    }

    /// Ensures a sub-interface exists for `spec`, adopting a same-named
    /// existing link rather than recreating it, or creating a new one under
    /// the first free candidate name. Returns the interface name used and
    /// whether this call created it (so the caller knows it owns cleanup).
    pub async fn ensure(&self, prefix: &str, vrid: u8, mode: SubInterfaceMode, base_interface: &str, mac: Option<[u8; 6]>) -> Result<(String, bool)> {
        for candidate in Self::candidate_names(prefix, vrid).take(1000) {
            if self.backend.link_exists(&candidate).await? {
                if self.backend.is_adoptable(&candidate).await? {
                    // Adopt: a prior run (or this process, across reload)
                    // already created a compatible link under this name.
                    // We don't own its teardown.
                    return Ok((candidate, false));
                }
                continue;
            }
            let spec = SubInterfaceSpec {
                name: candidate.clone(),
                base_interface: base_interface.to_string(),
                mode,
                mac,
            };
            self.backend.create_link(&spec).await?;
            return Ok((candidate, true));
        }
        Err(crate::error::Error::config(format!(
            "exhausted sub-interface name candidates for prefix {prefix} vrid {vrid}"
        )))
    }

    pub async fn teardown(&self, name: &str, is_ours: bool) -> Result<()> {
        if is_ours {
            self.backend.delete_link(name).await?;
        }
        Ok(())
    }
}
