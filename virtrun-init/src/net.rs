//! Loopback interface configuration via socket ioctls.
//!
//! No `ip` binary exists in the guest, so the interface flags and
//! addresses are set directly. IPv6 normally assigns `::1` by itself
//! when the interface comes up; the explicit add below covers kernels
//! configured otherwise and tolerates the duplicate.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Interface being configured.
const LOOPBACK: &str = "lo";

/// `in6_ifreq` from `linux/ipv6.h`; libc does not expose it.
#[repr(C)]
struct In6Ifreq {
    /// Address to assign.
    ifr6_addr: libc::in6_addr,
    /// Prefix length in bits.
    ifr6_prefixlen: u32,
    /// Interface index.
    ifr6_ifindex: libc::c_int,
}

/// Creates a datagram socket for interface ioctls.
fn ioctl_socket(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Returns a zeroed `ifreq` with the loopback name filled in.
fn loopback_ifreq() -> libc::ifreq {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(LOOPBACK.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr
}

/// Brings `lo` administratively up and binds `127.0.0.1/8` and
/// `::1/128`.
pub fn setup_loopback() -> io::Result<()> {
    let sock = ioctl_socket(libc::AF_INET)?;

    // IFF_UP | IFF_RUNNING on top of whatever is already set.
    let mut ifr = loopback_ifreq();
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // 127.0.0.1/8.
    let mut ifr = loopback_ifreq();
    set_ipv4(&mut ifr, u32::from(std::net::Ipv4Addr::LOCALHOST));
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFADDR, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut ifr = loopback_ifreq();
    set_ipv4(&mut ifr, u32::from(std::net::Ipv4Addr::new(255, 0, 0, 0)));
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFNETMASK, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }

    add_ipv6_localhost()
}

/// Writes an IPv4 address into the `ifreq` address union.
fn set_ipv4(ifr: &mut libc::ifreq, addr_host_order: u32) {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: addr_host_order.to_be(),
        },
        sin_zero: [0; 8],
    };
    unsafe {
        let dst = std::ptr::addr_of_mut!(ifr.ifr_ifru.ifru_addr).cast::<libc::sockaddr_in>();
        dst.write(sin);
    }
}

/// Adds `::1/128`, tolerating a kernel that already did it.
fn add_ipv6_localhost() -> io::Result<()> {
    let sock = ioctl_socket(libc::AF_INET6)?;
    let ifindex = unsafe { libc::if_nametoindex(c"lo".as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error());
    }
    let req = In6Ifreq {
        ifr6_addr: libc::in6_addr {
            s6_addr: std::net::Ipv6Addr::LOCALHOST.octets(),
        },
        ifr6_prefixlen: 128,
        ifr6_ifindex: ifindex as libc::c_int,
    };
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFADDR, &req) } < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}
