//! Task-Friendly Sockets
//!
//! Nonblocking TCP sockets whose blocking points suspend the calling task
//! instead of the thread. Every descriptor is created with `SOCK_NONBLOCK`
//! and `SOCK_CLOEXEC`; would-block conditions turn into `fdwait` parks on
//! the reactor, and timeouts surface as `io::ErrorKind::TimedOut`.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::io::{fdwait, Interest};

/// A nonblocking TCP socket bound to the task scheduler for waiting.
pub struct NetSock {
    fd: RawFd,
}

impl NetSock {
    fn create(domain: libc::c_int) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(NetSock { fd })
    }

    /// Wrap an existing descriptor. The caller is responsible for it being
    /// nonblocking; `set_nonblocking` fixes up descriptors that are not.
    pub fn from_raw(fd: RawFd) -> Self {
        NetSock { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Set `O_NONBLOCK` on a descriptor that was not opened with it.
    pub fn set_nonblocking(&self) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Resolve `host` and connect to the first address that accepts,
    /// trying each in resolver order. Reports `Error::Hostname` when
    /// resolution yields nothing.
    pub fn dial(host: &str, port: u16, timeout: Option<Duration>) -> Result<NetSock> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::Hostname(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Hostname(host.to_string()));
        }
        let mut last_err = None;
        for addr in addrs {
            match NetSock::connect_to(&addr, timeout) {
                Ok(sock) => return Ok(sock),
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("no connect attempt recorded an error"))
    }

    /// Create a socket of the right family and connect it to `addr`.
    pub fn connect_to(addr: &SocketAddr, timeout: Option<Duration>) -> Result<NetSock> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let sock = NetSock::create(domain)?;
        sock.connect(addr, timeout)?;
        Ok(sock)
    }

    /// Connect this socket, suspending until the handshake finishes or
    /// `timeout` passes.
    pub fn connect(&self, addr: &SocketAddr, timeout: Option<Duration>) -> Result<()> {
        let (storage, len) = sockaddr_from(addr);
        loop {
            let rc = unsafe {
                libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len)
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EADDRINUSE) => {
                    if fdwait(self.fd, Interest::Writable, timeout)? {
                        return match self.take_error()? {
                            Some(e) => Err(Error::Io(e)),
                            None => Ok(()),
                        };
                    }
                    return Err(Error::Io(io::ErrorKind::TimedOut.into()));
                }
                Some(libc::EISCONN) => return Ok(()),
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Create a listening socket bound to `addr` with `SO_REUSEADDR` set.
    pub fn listen(addr: &SocketAddr, backlog: i32) -> Result<NetSock> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let sock = NetSock::create(domain)?;
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let (storage, len) = sockaddr_from(addr);
        let rc =
            unsafe { libc::bind(sock.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if unsafe { libc::listen(sock.fd, backlog) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(sock)
    }

    /// Accept one connection, suspending until a peer arrives or `timeout`
    /// passes. The accepted socket is nonblocking and close-on-exec.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<(NetSock, SocketAddr)> {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe {
                libc::accept4(
                    self.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if rc >= 0 {
                let peer = sockaddr_to(&storage)
                    .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                return Ok((NetSock { fd: rc }, peer));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    if !fdwait(self.fd, Interest::Readable, timeout)? {
                        return Err(Error::Io(io::ErrorKind::TimedOut.into()));
                    }
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Receive into `buf`, suspending while nothing is available. Returns
    /// the number of bytes read; zero means the peer closed.
    pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    if !fdwait(self.fd, Interest::Readable, timeout)? {
                        return Err(Error::Io(io::ErrorKind::TimedOut.into()));
                    }
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Send all of `buf`, suspending whenever the socket buffer is full.
    /// On timeout a prefix may already have been written.
    pub fn send(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf[sent..].as_ptr() as *const libc::c_void,
                    buf.len() - sent,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                sent += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    if !fdwait(self.fd, Interest::Writable, timeout)? {
                        return Err(Error::Io(io::ErrorKind::TimedOut.into()));
                    }
                }
                _ => return Err(Error::Io(err)),
            }
        }
        Ok(sent)
    }

    /// Receive until `buf` is full or the peer closes.
    pub fn recv_all(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.recv(&mut buf[pos..], timeout)?;
            if n == 0 {
                break;
            }
            pos += n;
        }
        Ok(pos)
    }

    /// The locally bound address, as assigned by the kernel.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        sockaddr_to(&storage)
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "unknown family")))
    }

    /// Pending asynchronous socket error, if any.
    fn take_error(&self) -> Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }
}

impl Drop for NetSock {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr.s_addr = u32::from(*a.ip()).to_be();
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_addr.s6_addr = a.ip().octets();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = storage as *const _ as *const libc::sockaddr_in;
            let (ip, port) = unsafe {
                (
                    Ipv4Addr::from(u32::from_be((*sin).sin_addr.s_addr)),
                    u16::from_be((*sin).sin_port),
                )
            };
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = storage as *const _ as *const libc::sockaddr_in6;
            unsafe {
                let ip = Ipv6Addr::from((*sin6).sin6_addr.s6_addr);
                let port = u16::from_be((*sin6).sin6_port);
                Some(SocketAddr::new(ip.into(), port))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage), Some(addr));
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage), Some(addr));
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert_eq!(sockaddr_to(&storage), None);
    }
}
