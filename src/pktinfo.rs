//! Ancillary data (pktinfo) transport (C12).
//!
//! No portable safe async API exposes `recvmsg`/`sendmsg` control data, so
//! this module is a thin `unsafe` layer over `libc::recvmsg`/`libc::sendmsg`
//! and the `CMSG_*` macros, driven through Tokio's readiness-based
//! [`UdpSocket::try_io`] so it composes with the rest of the async stack
//! without a dedicated blocking thread.

use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::AsRawFd;

use tokio::io::Interest;
use tokio::net::UdpSocket;

/// Room for one `in_pktinfo`/`in6_pktinfo` cmsg plus header/alignment slack.
const CMSG_BUF_LEN: usize = 128;

/// An address-family-tagged, opaque capsule holding the raw `in_pktinfo` /
/// `in6_pktinfo` payload (without the surrounding `cmsghdr`). Comparable
/// byte-for-byte and cheap to clone, matching the ingress loop's "differs
/// byte-for-byte" cache comparison and the `ArcSwap` snapshot it publishes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PktInfo {
    v6: bool,
    raw: Vec<u8>,
}

/// Enables `IP_PKTINFO` (v4 sockets) or `IPV6_RECVPKTINFO` (v6 sockets) on a
/// freshly bound socket so its `recvmsg` calls carry destination-address
/// ancillary data.
pub fn enable_pktinfo(socket: &socket2::Socket, v6: bool) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;
    let (level, name) = if v6 {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
    } else {
        (libc::IPPROTO_IP, libc::IP_PKTINFO)
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one datagram with its pktinfo ancillary data, if present.
///
/// Returns `(bytes_read, source_addr, pktinfo, truncated)`, where `truncated`
/// covers both a datagram that didn't fit `buf` (`MSG_TRUNC`) and a cmsg
/// buffer that didn't fit the ancillary data (`MSG_CTRUNC`) — callers treat
/// both the same way as a read error.
pub async fn recv_with_pktinfo(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<PktInfo>, bool)> {
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || unsafe { recvmsg_once(socket.as_raw_fd(), buf) }) {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Non-blocking single attempt, used by batch-mode ingress to drain
/// already-queued datagrams between wakeups without paying for another
/// `readable().await`. Returns `WouldBlock` once nothing more is pending.
pub fn try_recv_with_pktinfo(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<PktInfo>, bool)> {
    socket.try_io(Interest::READABLE, || unsafe { recvmsg_once(socket.as_raw_fd(), buf) })
}

/// Send one datagram, attaching `pktinfo` as ancillary data if present so the
/// kernel picks the same local source address the client originally targeted.
pub async fn send_with_pktinfo(socket: &UdpSocket, buf: &[u8], dest: SocketAddr, pktinfo: Option<&PktInfo>) -> io::Result<usize> {
    loop {
        socket.writable().await?;
        match socket.try_io(Interest::WRITABLE, || unsafe { sendmsg_once(socket.as_raw_fd(), buf, dest, pktinfo) }) {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

unsafe fn recvmsg_once(fd: std::os::unix::io::RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<PktInfo>, bool)> {
    let mut storage: libc::sockaddr_storage = std::mem::zeroed();
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = std::mem::zeroed();
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = libc::recvmsg(fd, &mut msg, 0);
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let truncated = (msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC)) != 0;
    let addr = sockaddr_storage_to_socketaddr(&storage)?;

    let mut pktinfo = None;
    let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
    while !cmsg.is_null() {
        let level = (*cmsg).cmsg_level;
        let ty = (*cmsg).cmsg_type;
        if level == libc::IPPROTO_IP && ty == libc::IP_PKTINFO {
            let data = libc::CMSG_DATA(cmsg);
            let len = size_of::<libc::in_pktinfo>();
            pktinfo = Some(PktInfo {
                v6: false,
                raw: std::slice::from_raw_parts(data, len).to_vec(),
            });
        } else if level == libc::IPPROTO_IPV6 && ty == libc::IPV6_PKTINFO {
            let data = libc::CMSG_DATA(cmsg);
            let len = size_of::<libc::in6_pktinfo>();
            pktinfo = Some(PktInfo {
                v6: true,
                raw: std::slice::from_raw_parts(data, len).to_vec(),
            });
        }
        cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
    }

    Ok((n as usize, addr, pktinfo, truncated))
}

unsafe fn sendmsg_once(fd: std::os::unix::io::RawFd, buf: &[u8], dest: SocketAddr, pktinfo: Option<&PktInfo>) -> io::Result<usize> {
    let (mut storage, len) = socketaddr_to_sockaddr_storage(dest);
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = std::mem::zeroed();
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = len;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(info) = pktinfo {
        let (level, ty) = if info.v6 { (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) } else { (libc::IPPROTO_IP, libc::IP_PKTINFO) };
        let data_len = info.raw.len();
        let space = libc::CMSG_SPACE(data_len as u32) as usize;
        assert!(space <= cmsg_buf.len(), "pktinfo cmsg exceeds scratch buffer");

        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = level;
        (*cmsg).cmsg_type = ty;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
        std::ptr::copy_nonoverlapping(info.raw.as_ptr(), libc::CMSG_DATA(cmsg), data_len);
    }

    let n = libc::sendmsg(fd, &msg, 0);
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn sockaddr_storage_to_socketaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: libc::sockaddr_in = unsafe { std::ptr::read(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 = unsafe { std::ptr::read(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, sin6.sin6_flowinfo, sin6.sin6_scope_id)))
        }
        family => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unsupported sockaddr family {family}"))),
    }
}

fn socketaddr_to_sockaddr_storage(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}
