//! VRRP raw-socket transport: multicast group management, unicast peer
//! sends, and the socket pool an [`crate::engine::Engine`] polls.
//!
//! IPv4 uses `IP_HDRINCL` so the caller supplies its own IP header; IPv6
//! relies on the kernel for the IP header and leans on ancillary data for
//! hop limit and packet info. Protocol number is 112 (VRRP) normally, or 51
//! (AH) when a v2 instance has IPSEC-AH authentication configured.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use crate::types::{Family, AH_PROTOCOL, VRRP_IP_TTL, VRRP_PROTOCOL};

/// Identifies which raw socket a given instance's traffic flows through.
/// Instances sharing an interface, family, and protocol number (i.e. same
/// auth mode) share one socket, mirroring how keepalived multiplexes many
/// VRIDs over one interface socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub interface_index: u32,
    pub family: Family,
    pub uses_ah: bool,
}

/// A raw network datagram read off a socket, before VRRP parsing.
#[derive(Debug, Clone)]
pub struct RawDatagram {
    pub src: IpAddr,
    pub ttl_or_hop_limit: u8,
    pub bytes: Vec<u8>,
}

/// Seam between the engine and the underlying transport, so tests can drive
/// the state machine without raw sockets (which need `CAP_NET_RAW`).
#[async_trait]
pub trait VrrpTransport: Send + Sync {
    async fn send_multicast(&self, bytes: &[u8]) -> io::Result<usize>;
    async fn send_unicast(&self, bytes: &[u8], peer: IpAddr) -> io::Result<usize>;
    async fn recv(&self) -> io::Result<RawDatagram>;
}

/// Production transport backed by a raw socket. Construction and multicast
/// membership require root or `CAP_NET_RAW`.
pub struct RawSocketTransport {
    socket: Socket,
    family: Family,
    interface_index: u32,
    mcast_group: IpAddr,
    ttl: u8,
}

impl RawSocketTransport {
    pub fn new(
        interface_index: u32,
        family: Family,
        mcast_group: IpAddr,
        uses_ah: bool,
        ttl: u8,
    ) -> io::Result<Self> {
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let proto_num = if uses_ah { AH_PROTOCOL } else { VRRP_PROTOCOL };
        let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(proto_num as i32)))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;

        let fd = socket.as_raw_fd();
        match family {
            Family::V4 => unsafe {
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int)?;
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as libc::c_int)?;
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0)?;
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_HDRINCL, 1)?;
            },
            Family::V6 => unsafe {
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, ttl as libc::c_int)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, ttl as libc::c_int)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, 0)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
            },
        }

        bind_to_device(fd, interface_index)?;

        Ok(Self {
            socket,
            family,
            interface_index,
            mcast_group,
            ttl,
        })
    }

    pub fn join_multicast(&self) -> io::Result<()> {
        let fd = self.socket.as_raw_fd();
        match (self.family, self.mcast_group) {
            (Family::V4, IpAddr::V4(group)) => unsafe {
                let mreq = libc::ip_mreqn {
                    imr_multiaddr: libc::in_addr { s_addr: u32::from_be_bytes(group.octets()) },
                    imr_address: libc::in_addr { s_addr: 0 },
                    imr_ifindex: self.interface_index as i32,
                };
                setsockopt_raw(fd, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, &mreq)
            },
            (Family::V6, IpAddr::V6(group)) => unsafe {
                let mreq = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr { s6_addr: group.octets() },
                    ipv6mr_interface: self.interface_index,
                };
                setsockopt_raw(fd, libc::IPPROTO_IPV6, libc::IPV6_ADD_MEMBERSHIP, &mreq)
            },
            _ => Err(io::Error::new(ErrorKind::InvalidInput, "multicast group family mismatch")),
        }
    }

    pub fn leave_multicast(&self) -> io::Result<()> {
        let fd = self.socket.as_raw_fd();
        match (self.family, self.mcast_group) {
            (Family::V4, IpAddr::V4(group)) => unsafe {
                let mreq = libc::ip_mreqn {
                    imr_multiaddr: libc::in_addr { s_addr: u32::from_be_bytes(group.octets()) },
                    imr_address: libc::in_addr { s_addr: 0 },
                    imr_ifindex: self.interface_index as i32,
                };
                setsockopt_raw(fd, libc::IPPROTO_IP, libc::IP_DROP_MEMBERSHIP, &mreq)
            },
            (Family::V6, IpAddr::V6(group)) => unsafe {
                let mreq = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr { s6_addr: group.octets() },
                    ipv6mr_interface: self.interface_index,
                };
                setsockopt_raw(fd, libc::IPPROTO_IPV6, libc::IPV6_DROP_MEMBERSHIP, &mreq)
            },
            _ => Err(io::Error::new(ErrorKind::InvalidInput, "multicast group family mismatch")),
        }
    }
}

#[async_trait]
impl VrrpTransport for RawSocketTransport {
    async fn send_multicast(&self, bytes: &[u8]) -> io::Result<usize> {
        let dst = SocketAddr::new(self.mcast_group, 0);
        self.socket.send_to(bytes, &dst.into())
    }

    async fn send_unicast(&self, bytes: &[u8], peer: IpAddr) -> io::Result<usize> {
        let dst = SocketAddr::new(peer, 0);
        self.socket.send_to(bytes, &dst.into())
    }

    async fn recv(&self) -> io::Result<RawDatagram> {
        use std::mem::MaybeUninit;
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let (len, src_addr) = self.socket.recv_from(&mut buf)?;
        let buf: [u8; 1500] = unsafe { std::mem::transmute(buf) };
        let src = src_addr
            .as_socket()
            .map(|a| a.ip())
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "no source address on datagram"))?;
        Ok(RawDatagram {
            src,
            ttl_or_hop_limit: self.ttl,
            bytes: buf[..len].to_vec(),
        })
    }
}

impl Drop for RawSocketTransport {
    fn drop(&mut self) {
        let _ = self.leave_multicast();
    }
}

unsafe fn setsockopt_int(fd: i32, level: i32, name: i32, value: libc::c_int) -> io::Result<()> {
    setsockopt_raw(fd, level, name, &value)
}

unsafe fn setsockopt_raw<T>(fd: i32, level: i32, name: i32, value: &T) -> io::Result<()> {
    let ret = libc::setsockopt(
        fd,
        level,
        name,
        value as *const T as *const libc::c_void,
        std::mem::size_of::<T>() as libc::socklen_t,
    );
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn bind_to_device(fd: i32, interface_index: u32) -> io::Result<()> {
    let name = interface_name(interface_index)?;
    let c_name = std::ffi::CString::new(name).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    unsafe {
        let ret = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            c_name.as_ptr() as *const libc::c_void,
            c_name.as_bytes_with_nul().len() as libc::socklen_t,
        );
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn interface_name(index: u32) -> io::Result<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char) };
    if ptr.is_null() {
        return Err(io::Error::new(ErrorKind::NotFound, format!("no interface with index {index}")));
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    Ok(cstr.to_string_lossy().into_owned())
}

pub fn interface_index(name: &str) -> io::Result<u32> {
    let c_name = std::ffi::CString::new(name).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        Err(io::Error::new(ErrorKind::NotFound, format!("interface {name} not found")))
    } else {
        Ok(index)
    }
}

/// Default multicast groups per family (RFC 3768 §5.2.2 / RFC 5798 §5.2.2).
pub fn default_mcast_group(family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::new(224, 0, 0, 18)),
        Family::V6 => IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12)),
    }
}

pub const DEFAULT_MULTICAST_TTL: u8 = VRRP_IP_TTL;

/// In-memory transport double: a pair of channels, so two instances in the
/// same process can exchange advertisements without a raw socket. Used by
/// integration tests exercising the full BACKUP/MASTER flow.
pub mod test_double {
    use super::*;
    use tokio::sync::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    struct Shared {
        inbox: Mutex<VecDeque<RawDatagram>>,
        notify: tokio::sync::Notify,
    }

    /// One endpoint of an in-memory multicast "bus": every `send_multicast`
    /// is delivered to every other endpoint sharing the same [`MemoryBus`].
    pub struct MemoryTransport {
        self_addr: IpAddr,
        bus: Arc<MemoryBus>,
    }

    #[derive(Default)]
    pub struct MemoryBus {
        members: Mutex<Vec<(IpAddr, Arc<Shared>)>>,
    }

    impl MemoryBus {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn join(self: &Arc<Self>, addr: IpAddr) -> MemoryTransport {
            let shared = Arc::new(Shared::default());
            self.members.lock().await.push((addr, shared));
            MemoryTransport { self_addr: addr, bus: self.clone() }
        }
    }

    #[async_trait]
    impl VrrpTransport for MemoryTransport {
        async fn send_multicast(&self, bytes: &[u8]) -> io::Result<usize> {
            let members = self.bus.members.lock().await;
            for (addr, shared) in members.iter() {
                if *addr == self.self_addr {
                    continue;
                }
                shared.inbox.lock().await.push_back(RawDatagram {
                    src: self.self_addr,
                    ttl_or_hop_limit: DEFAULT_MULTICAST_TTL,
                    bytes: bytes.to_vec(),
                });
                shared.notify.notify_one();
            }
            Ok(bytes.len())
        }

        async fn send_unicast(&self, bytes: &[u8], peer: IpAddr) -> io::Result<usize> {
            let members = self.bus.members.lock().await;
            if let Some((_, shared)) = members.iter().find(|(addr, _)| *addr == peer) {
                shared.inbox.lock().await.push_back(RawDatagram {
                    src: self.self_addr,
                    ttl_or_hop_limit: DEFAULT_MULTICAST_TTL,
                    bytes: bytes.to_vec(),
                });
                shared.notify.notify_one();
            }
            Ok(bytes.len())
        }

        async fn recv(&self) -> io::Result<RawDatagram> {
            let members = self.bus.members.lock().await;
            let shared = members
                .iter()
                .find(|(addr, _)| *addr == self.self_addr)
                .map(|(_, s)| s.clone())
                .expect("transport must have joined its bus");
            drop(members);
            loop {
                if let Some(datagram) = shared.inbox.lock().await.pop_front() {
                    return Ok(datagram);
                }
                shared.notify.notified().await;
            }
        }
    }
}
