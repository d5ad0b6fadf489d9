//! Error taxonomy for the VRRP engine.
//!
//! Mirrors the categories a reader familiar with keepalived's `vrrp.c` would
//! expect: configuration mistakes caught at init/reload, wire-level
//! validation failures on received packets, resource faults that push an
//! instance into FAULT, and script failures. See the rate-limit bitset in
//! [`crate::instance::RateLimitFlags`] for how wire errors are throttled.

/// A specialized `Result` for VRRP operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("resource fault: {0}")]
    Resource(#[from] ResourceFault),

    #[error("script failure: {0}")]
    Script(String),

    #[error(transparent)]
    Common(#[from] common::Error),
}

impl Error {
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    pub fn script(msg: impl std::fmt::Display) -> Self {
        Error::Script(msg.to_string())
    }
}

/// Validation failures on a received advertisement (RFC 3768 §6.1 / RFC 5798
/// §6.1 receive processing). Each variant has a 1:1 rate-limit bit in
/// [`crate::instance::RateLimitFlags`] so it is logged at most once per
/// "episode" per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet too short")]
    TooShort,
    #[error("packet length does not match expected length")]
    BadLength,
    #[error("unsupported or mismatched VRRP version")]
    BadVersion,
    #[error("packet type is not ADVERTISEMENT")]
    NotAdvertisement,
    #[error("TTL/hop-limit out of range")]
    BadTtl,
    #[error("VRID does not match this instance")]
    VridMismatch,
    #[error("authentication type mismatch")]
    AuthTypeMismatch,
    #[error("authentication failed")]
    AuthFailure,
    #[error("AH replay detected (sequence number not increasing)")]
    AhReplay,
    #[error("AH sequence space exhausted")]
    AhCycled,
    #[error("advertisement interval mismatch")]
    AdverIntervalMismatch,
    #[error("configured VIP set does not match advertised VIPs")]
    VipMismatch,
    #[error("checksum invalid")]
    BadChecksum,
    #[error("advertisement received from duplicate address owner")]
    DuplicateOwner,
}

/// Conditions that force an instance into FAULT until cleared by a later
/// netlink/tracking event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceFault {
    #[error("no usable source IP address available")]
    NoSourceIp,
    #[error("base interface {0} is down")]
    InterfaceDown(String),
    #[error("failed to create VMAC/IPVLAN sub-interface: {0}")]
    VmacCreationFailed(String),
    #[error("failed to open or bind socket: {0}")]
    SocketError(String),
    #[error("duplicate VRID {vrid} on interface {interface}")]
    DuplicateVrid { vrid: u8, interface: String },
    #[error("tracked resource unavailable: {0}")]
    TrackFault(String),
}
