//! VRRP wire codec: shared v2/v3 header, address list, v2 auth trailer.
//!
//! Field layout follows RFC 3768 §5.1 (v2) and RFC 5798 §5.1 (v3). The two
//! versions share everything except the byte at offset 4 (v2: auth-type:
//! adver-int-seconds, split across two whole bytes) vs offset 4-5 (v3:
//! 4-bit reserved + 12-bit adver-int-centiseconds), and the v2-only 8-byte
//! trailer.

use std::net::IpAddr;

use crate::checksum;
use crate::error::{Result, WireError};
use crate::types::{Family, VrrpVersion, VRRP_TYPE_ADVERTISEMENT, VRRP_V2_AUTH_LEN};

/// Fixed portion of the header before the address list: version/type, vrid,
/// priority, count, auth-type-or-reserved+adver-int, checksum.
const FIXED_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpPacket {
    pub version: VrrpVersion,
    pub vrid: u8,
    pub priority: u8,
    pub addresses: Vec<IpAddr>,
    /// Seconds for v2, centiseconds for v3.
    pub adver_int: u16,
    /// v2 only: wire auth-type byte (0/1/2). Ignored for v3.
    pub v2_auth_type: u8,
    /// v2 only: 8-byte simple-password/reserved trailer.
    pub v2_auth_data: [u8; VRRP_V2_AUTH_LEN],
    pub checksum: u16,
}

impl VrrpPacket {
    pub fn expected_wire_len(version: VrrpVersion, family: Family, naddr: usize) -> usize {
        let addr_size = match family {
            Family::V4 => 4,
            Family::V6 => 16,
        };
        let mut len = FIXED_HEADER_LEN + naddr * addr_size;
        if version == VrrpVersion::V2 {
            len += VRRP_V2_AUTH_LEN;
        }
        len
    }

    /// Builds the wire representation with checksum left as given (callers
    /// compute it separately via [`Self::set_checksum`] so unicast callers
    /// can patch the destination-dependent checksum per peer).
    pub fn to_bytes(&self, family: Family) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::expected_wire_len(self.version, family, self.addresses.len()));
        buf.push((self.version.as_u8() << 4) | VRRP_TYPE_ADVERTISEMENT);
        buf.push(self.vrid);
        buf.push(self.priority);
        buf.push(self.addresses.len() as u8);

        match self.version {
            VrrpVersion::V2 => {
                buf.push(self.v2_auth_type);
                buf.push(self.adver_int as u8);
            }
            VrrpVersion::V3 => {
                let field = self.adver_int & 0x0FFF;
                buf.extend_from_slice(&field.to_be_bytes());
            }
        }

        buf.extend_from_slice(&self.checksum.to_be_bytes());

        for addr in &self.addresses {
            match addr {
                IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
                IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
            }
        }

        if self.version == VrrpVersion::V2 {
            buf.extend_from_slice(&self.v2_auth_data);
        }

        buf
    }

    /// Parses a VRRP packet, tolerating Ethernet padding up to the 60-octet
    /// minimum frame size and VLAN-tag 4-byte multiples appended after the
    /// logical payload (§4.1 "Expected packet length").
    pub fn parse(buf: &[u8], family: Family) -> Result<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(WireError::TooShort.into());
        }

        let version_type = buf[0];
        let version = match version_type >> 4 {
            2 => VrrpVersion::V2,
            3 => VrrpVersion::V3,
            _ => return Err(WireError::BadVersion.into()),
        };
        let packet_type = version_type & 0x0F;
        if packet_type != VRRP_TYPE_ADVERTISEMENT {
            return Err(WireError::NotAdvertisement.into());
        }

        let vrid = buf[1];
        let priority = buf[2];
        let count_ip = buf[3] as usize;

        let (v2_auth_type, adver_int) = match version {
            VrrpVersion::V2 => (buf[4], buf[5] as u16),
            VrrpVersion::V3 => {
                let field = u16::from_be_bytes([buf[4], buf[5]]);
                (0, field & 0x0FFF)
            }
        };

        let checksum = u16::from_be_bytes([buf[6], buf[7]]);

        let addr_size = match family {
            Family::V4 => 4,
            Family::V6 => 16,
        };
        let addr_list_len = count_ip * addr_size;
        let auth_trailer_len = if version == VrrpVersion::V2 { VRRP_V2_AUTH_LEN } else { 0 };
        let expected_len = FIXED_HEADER_LEN + addr_list_len + auth_trailer_len;

        if !length_tolerable(buf.len(), expected_len) {
            return Err(WireError::BadLength.into());
        }
        if buf.len() < expected_len {
            return Err(WireError::TooShort.into());
        }

        let mut offset = FIXED_HEADER_LEN;
        let mut addresses = Vec::with_capacity(count_ip);
        for _ in 0..count_ip {
            let addr = match family {
                Family::V4 => {
                    let octets: [u8; 4] = buf[offset..offset + 4].try_into().unwrap();
                    IpAddr::V4(octets.into())
                }
                Family::V6 => {
                    let octets: [u8; 16] = buf[offset..offset + 16].try_into().unwrap();
                    IpAddr::V6(octets.into())
                }
            };
            addresses.push(addr);
            offset += addr_size;
        }

        let mut v2_auth_data = [0u8; VRRP_V2_AUTH_LEN];
        if version == VrrpVersion::V2 {
            v2_auth_data.copy_from_slice(&buf[offset..offset + VRRP_V2_AUTH_LEN]);
        }

        Ok(VrrpPacket {
            version,
            vrid,
            priority,
            addresses,
            adver_int,
            v2_auth_type,
            v2_auth_data,
            checksum,
        })
    }

    /// v2: one's-complement checksum over the VRRP header, address list, and
    /// auth trailer, with the checksum field itself zeroed.
    pub fn checksum_v2(&self, family: Family) -> u16 {
        let mut bytes = self.to_bytes(family);
        bytes[6] = 0;
        bytes[7] = 0;
        checksum::internet_checksum(&bytes)
    }

    /// v3: checksum over an IPv4 pseudo-header (src, dst, zero, proto=112,
    /// len) followed by the VRRP payload. `pseudo_dst` is the multicast
    /// group when checksum-compat mode is engaged, otherwise the real
    /// destination (§9, §4.1).
    pub fn checksum_v3(&self, family: Family, src: std::net::Ipv4Addr, pseudo_dst: std::net::Ipv4Addr) -> u16 {
        let mut bytes = self.to_bytes(family);
        bytes[6] = 0;
        bytes[7] = 0;

        let mut pseudo = Vec::with_capacity(12);
        pseudo.extend_from_slice(&src.octets());
        pseudo.extend_from_slice(&pseudo_dst.octets());
        pseudo.push(0);
        pseudo.push(crate::types::VRRP_PROTOCOL);
        pseudo.extend_from_slice(&(bytes.len() as u16).to_be_bytes());

        let sum = checksum::checksum_accumulate(&pseudo, 0);
        let sum = checksum::checksum_accumulate(&bytes, sum);
        checksum::finish(sum)
    }

    /// v3 over IPv6: RFC 2460 §8.1 pseudo-header (src, dst, upper-layer
    /// length as a 32-bit field, 3 zero bytes, next header = 112) followed
    /// by the VRRP payload.
    pub fn checksum_v3_ipv6(&self, src: std::net::Ipv6Addr, pseudo_dst: std::net::Ipv6Addr) -> u16 {
        let mut bytes = self.to_bytes(Family::V6);
        bytes[6] = 0;
        bytes[7] = 0;

        let mut pseudo = Vec::with_capacity(40);
        pseudo.extend_from_slice(&src.octets());
        pseudo.extend_from_slice(&pseudo_dst.octets());
        pseudo.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        pseudo.extend_from_slice(&[0, 0, 0]);
        pseudo.push(crate::types::VRRP_PROTOCOL);

        let sum = checksum::checksum_accumulate(&pseudo, 0);
        let sum = checksum::checksum_accumulate(&bytes, sum);
        checksum::finish(sum)
    }

    pub fn set_checksum(&mut self, value: u16) {
        self.checksum = value;
    }
}

/// §4.1: tolerate Ethernet padding up to the 60-octet minimum frame (46
/// bytes of payload once the 14-byte L2 header is excluded) and additional
/// 4-byte VLAN-tag padding beyond that.
fn length_tolerable(actual: usize, expected: usize) -> bool {
    if actual == expected {
        return true;
    }
    if actual < expected {
        return false;
    }
    let padding = actual - expected;
    let to_min_frame = 46usize.saturating_sub(expected);
    padding <= to_min_frame || padding % 4 == 0
}
