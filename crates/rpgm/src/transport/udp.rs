// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram socket setup and the ancillary-data socket reader.
//!
//! The reader recovers the datagram's destination address from PKTINFO
//! control messages, which the kernel does not place in the message name.
//! UDP-encapsulated endpoints and IPv6 endpoints require it; raw IPv4
//! endpoints read the destination from the visible IP header instead.

use crate::buffer::SkBuff;
use crate::config::IPPROTO_PGM;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrStorage};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::Instant;

/// Result of one non-blocking socket read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SockRead {
    /// A datagram of this length was read into the buffer.
    Data(usize),
    /// Nothing queued right now.
    WouldBlock,
    /// Zero-length read: orderly shutdown.
    Shutdown,
    /// Destination address unrecoverable; discard at the parse stage.
    NoDestination,
}

/// Create and bind a UDP socket for encapsulated PGM.
pub(crate) fn create_udp_socket(bind_addr: SocketAddr) -> io::Result<Socket> {
    let domain = Domain::for_address(bind_addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&bind_addr.into())?;
    configure(&socket, bind_addr.is_ipv6())?;
    Ok(socket)
}

/// Create and bind a raw socket speaking IP protocol 113.
pub(crate) fn create_raw_socket(bind_addr: SocketAddr) -> io::Result<Socket> {
    let domain = Domain::for_address(bind_addr);
    let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(i32::from(IPPROTO_PGM))))?;
    socket.bind(&bind_addr.into())?;
    configure(&socket, bind_addr.is_ipv6())?;
    Ok(socket)
}

/// Shared socket configuration: non-blocking, PKTINFO delivery enabled.
///
/// Blocking is implemented in the wait stage, never in the socket call.
pub(crate) fn configure(socket: &Socket, ipv6: bool) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    if ipv6 {
        setsockopt(socket, sockopt::Ipv6RecvPacketInfo, &true).map_err(errno_to_io)?;
    } else {
        setsockopt(socket, sockopt::Ipv4PacketInfo, &true).map_err(errno_to_io)?;
    }
    Ok(())
}

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

fn sockaddr_to_std(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        Some(SocketAddr::new(IpAddr::V4(sin.ip()), sin.port()))
    } else {
        addr.as_sockaddr_in6()
            .map(|sin6| SocketAddr::new(IpAddr::V6(sin6.ip()), sin6.port()))
    }
}

/// Read a single datagram into `skb`.
///
/// Populates source and destination addresses, length and timestamp. When
/// `require_pktinfo` is set (UDP encapsulation or IPv6) a datagram whose
/// destination cannot be recovered is reported as [`SockRead::NoDestination`].
pub(crate) fn recv_one(
    socket: &Socket,
    require_pktinfo: bool,
    local_port: u16,
    skb: &mut SkBuff,
) -> io::Result<SockRead> {
    let fd = socket.as_raw_fd();

    let (len, src, dst_ip) = {
        let mut iov = [IoSliceMut::new(skb.storage_mut())];
        let mut cmsg_buffer = nix::cmsg_space!(libc::in_pktinfo, libc::in6_pktinfo);
        let msg = match recvmsg::<SockaddrStorage>(
            fd,
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(msg) => msg,
            Err(Errno::EAGAIN) => return Ok(SockRead::WouldBlock),
            Err(errno) => return Err(errno_to_io(errno)),
        };

        let src = msg.address.as_ref().and_then(sockaddr_to_std);
        let mut dst_ip = None;
        for cmsg in msg.cmsgs() {
            match cmsg {
                ControlMessageOwned::Ipv4PacketInfo(info) => {
                    dst_ip = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                        info.ipi_addr.s_addr,
                    ))));
                    break;
                }
                ControlMessageOwned::Ipv6PacketInfo(info) => {
                    dst_ip = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
                    break;
                }
                _ => {}
            }
        }
        (msg.bytes, src, dst_ip)
    };

    if len == 0 {
        return Ok(SockRead::Shutdown);
    }

    if require_pktinfo && dst_ip.is_none() {
        log::debug!("[udp] datagram without PKTINFO, discarding");
        return Ok(SockRead::NoDestination);
    }

    let src = src.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let dst = SocketAddr::new(
        dst_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        local_port,
    );
    skb.set_received(len, src, dst, Instant::now());
    Ok(SockRead::Data(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn recv_one_populates_addresses() {
        let socket = create_udp_socket(loopback()).expect("bind");
        let local: SocketAddr = socket
            .local_addr()
            .expect("local addr")
            .as_socket()
            .expect("socket addr");

        let sender = UdpSocket::bind(loopback()).expect("sender bind");
        sender.send_to(b"ping", local).expect("send");

        let mut skb = SkBuff::with_capacity(1500);
        // loopback delivery is immediate, retry briefly for scheduling noise
        let mut outcome = SockRead::WouldBlock;
        for _ in 0..50 {
            outcome = recv_one(&socket, true, local.port(), &mut skb).expect("recv");
            if outcome != SockRead::WouldBlock {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        assert_eq!(outcome, SockRead::Data(4));
        assert_eq!(skb.filled(), b"ping");
        assert_eq!(skb.src.port(), sender.local_addr().expect("addr").port());
        assert_eq!(skb.dst, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()));
    }

    #[test]
    fn recv_one_reports_would_block() {
        let socket = create_udp_socket(loopback()).expect("bind");
        let mut skb = SkBuff::with_capacity(1500);
        let outcome = recv_one(&socket, true, 0, &mut skb).expect("recv");
        assert_eq!(outcome, SockRead::WouldBlock);
    }
}
