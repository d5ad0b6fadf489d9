//! Shared constants and small enums used across the wire codec, the state
//! machine, and the config data model.
//!
//! Based on RFC 3768 (VRRPv2) and RFC 5798 (VRRPv3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// VRRP IP protocol number (both versions).
pub const VRRP_PROTOCOL: u8 = 112;
/// IPSEC Authentication Header protocol number, used instead of 112 when
/// VRRPv2 auth-type is IPSEC-AH.
pub const AH_PROTOCOL: u8 = 51;

/// Priority reserved for the address owner.
pub const VRRP_PRIORITY_OWNER: u8 = 255;
/// Priority value meaning "I am releasing mastership".
pub const VRRP_PRIORITY_RELEASE: u8 = 0;

/// Required TTL/hop-limit for multicast VRRP traffic.
pub const VRRP_IP_TTL: u8 = 255;

/// VRRP packet type field (always ADVERTISEMENT).
pub const VRRP_TYPE_ADVERTISEMENT: u8 = 1;

/// Fixed 8-byte auth trailer present on every VRRPv2 wire packet, whether or
/// not simple-password authentication is in use.
pub const VRRP_V2_AUTH_LEN: usize = 8;

/// Protocol version in use by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VrrpVersion {
    V2 = 2,
    V3 = 3,
}

impl VrrpVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for VrrpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Address family an instance operates over. VRRPv2 is IPv4-only; VRRPv3
/// supports both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    V4,
    V6,
}

/// VRRPv2 authentication mode. VRRPv3 carries no authentication (RFC 5798
/// removed it; integrity is left to IPsec at the IP layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    None,
    SimplePassword,
    IpsecAh,
}

impl AuthType {
    pub fn wire_value(self) -> u8 {
        match self {
            AuthType::None => 0,
            AuthType::SimplePassword => 1,
            AuthType::IpsecAh => 2,
        }
    }

    pub fn from_wire_value(v: u8) -> Option<Self> {
        match v {
            0 => Some(AuthType::None),
            1 => Some(AuthType::SimplePassword),
            2 => Some(AuthType::IpsecAh),
            _ => None,
        }
    }
}

/// State machine states (§4.4). `Deleted` is transient, used only while a
/// reload is tearing an instance down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrrpState {
    Init,
    Backup,
    Master,
    Fault,
    Deleted,
}

impl fmt::Display for VrrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VrrpState::Init => "INIT",
            VrrpState::Backup => "BACKUP",
            VrrpState::Master => "MASTER",
            VrrpState::Fault => "FAULT",
            VrrpState::Deleted => "DELETED",
        };
        write!(f, "{s}")
    }
}

/// Reasons an instance can be forced into FAULT, tracked as a bitset on the
/// instance so that clearing one source of fault doesn't clobber another
/// still-active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultReason {
    NoSourceIp,
    InterfaceDown,
    TrackFault,
    ConfigError,
    DuplicateVrid,
    VmacFailure,
}

/// Events delivered to notify scripts / the notify FIFO (§6 Notify events).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Backup,
    Master,
    Fault,
    Stop,
    Deleted,
    MasterRxLowerPri,
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotifyEvent::Backup => "BACKUP",
            NotifyEvent::Master => "MASTER",
            NotifyEvent::Fault => "FAULT",
            NotifyEvent::Stop => "STOP",
            NotifyEvent::Deleted => "DELETED",
            NotifyEvent::MasterRxLowerPri => "MASTER_RX_LOWER_PRI",
        };
        write!(f, "{s}")
    }
}
