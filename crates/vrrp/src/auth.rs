//! VRRPv2 authentication: simple password and IPSEC-AH (RFC 2402, truncated
//! to the subset keepalived actually implements — HMAC-MD5 ICV, SPI fixed to
//! the advertising source address, monotonically increasing sequence number
//! used purely for replay detection, no SA negotiation).
//!
//! VRRPv3 carries none of this; callers only reach into this module when
//! `AuthType` is `SimplePassword` or `IpsecAh` on a v2 instance.

use hmac::{Hmac, Mac};
use md5::Md5;
use std::net::IpAddr;

use crate::error::{Result, WireError};

type HmacMd5 = Hmac<Md5>;

/// Truncated ICV length keepalived uses: the full HMAC-MD5 output is 16
/// bytes but only the first 12 are transmitted, per the IPSEC-AH default.
pub const AH_ICV_LEN: usize = 12;
/// Fixed-size AH header preceding the ICV: next-header, length, reserved,
/// SPI, sequence number.
pub const AH_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhHeader {
    pub next_header: u8,
    pub payload_len: u8,
    pub spi: u32,
    pub seq_number: u32,
}

impl AhHeader {
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < AH_HEADER_LEN + AH_ICV_LEN {
            return Err(WireError::TooShort.into());
        }
        let header = AhHeader {
            next_header: buf[0],
            payload_len: buf[1],
            spi: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            seq_number: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };
        let icv = &buf[AH_HEADER_LEN..AH_HEADER_LEN + AH_ICV_LEN];
        Ok((header, icv))
    }

    pub fn to_bytes(self) -> [u8; AH_HEADER_LEN] {
        let mut out = [0u8; AH_HEADER_LEN];
        out[0] = self.next_header;
        out[1] = self.payload_len;
        out[4..8].copy_from_slice(&self.spi.to_be_bytes());
        out[8..12].copy_from_slice(&self.seq_number.to_be_bytes());
        out
    }
}

/// keepalived derives the AH SPI from the advertising router's source
/// address (`vrrp_in_chk_ipsecah`), so the ICV is keyed per-peer by address
/// rather than by a negotiated SA.
pub fn spi_for_source(saddr: IpAddr) -> u32 {
    match saddr {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            u32::from_be_bytes([octets[12], octets[13], octets[14], octets[15]])
        }
    }
}

/// Computes the truncated HMAC-MD5 ICV over `ah_header || vrrp_packet`,
/// with the ICV field itself zeroed during the computation, matching
/// keepalived's `vrrp_in_chk_ipsecah` / `vrrp_update_pkt` AH path.
pub fn compute_icv(password: &[u8], ah_header: &AhHeader, vrrp_packet: &[u8]) -> [u8; AH_ICV_LEN] {
    let mut mac = HmacMd5::new_from_slice(password).expect("HMAC accepts any key length");
    mac.update(&ah_header.to_bytes());
    mac.update(&[0u8; AH_ICV_LEN]);
    mac.update(vrrp_packet);
    let full = mac.finalize().into_bytes();
    let mut icv = [0u8; AH_ICV_LEN];
    icv.copy_from_slice(&full[..AH_ICV_LEN]);
    icv
}

pub fn verify_icv(
    password: &[u8],
    ah_header: &AhHeader,
    vrrp_packet: &[u8],
    received_icv: &[u8],
) -> bool {
    let expected = compute_icv(password, ah_header, vrrp_packet);
    constant_time_eq(&expected, received_icv)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Per-peer AH replay state. keepalived tracks this per-instance, not
/// per-peer, since v2 AH is only meaningful on a two-router VRID; we keep
/// the same single-counter model here.
#[derive(Debug, Clone, Copy, Default)]
pub struct AhReplayState {
    last_seq: u32,
    cycled: bool,
}

impl AhReplayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `seq` if strictly greater than the last seen sequence number,
    /// mirroring keepalived's simple monotonic check. Once the counter
    /// passes within 2 of `u32::MAX` it is considered cycled and further
    /// advertisements are rejected until the instance resets (matches
    /// `vrrp_in_chk_ipsecah`'s handling of sequence space exhaustion).
    pub fn check_and_update(&mut self, seq: u32) -> Result<()> {
        if self.cycled {
            return Err(WireError::AhCycled.into());
        }
        if seq <= self.last_seq && !(self.last_seq == 0 && seq == 0) {
            return Err(WireError::AhReplay.into());
        }
        self.last_seq = seq;
        if seq >= u32::MAX - 2 {
            self.cycled = true;
        }
        Ok(())
    }

    pub fn next_seq_for_tx(&mut self) -> u32 {
        self.last_seq = self.last_seq.saturating_add(1);
        self.last_seq
    }
}

/// Simple-password comparison, constant-time to avoid timing side channels
/// even though RFC 3768 simple-password auth offers no real security.
pub fn verify_simple_password(configured: &[u8; 8], received: &[u8; 8]) -> bool {
    constant_time_eq(configured, received)
}
