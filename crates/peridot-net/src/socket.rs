//! Owned, non-blocking TCP socket descriptors.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::addr::Address;

/// An owned TCP socket descriptor.
///
/// The descriptor is always non-blocking and close-on-exec, whether it came
/// from [`Socket::new_stream`] or from [`Socket::accept`]. Closing happens on
/// drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a new non-blocking IPv4 stream socket.
    pub fn new_stream() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// The raw descriptor number.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Binds to the given local address.
    pub fn bind(&self, addr: Address) -> io::Result<()> {
        let sa = addr.to_sockaddr_in();
        let rc = unsafe {
            libc::bind(
                self.fd(),
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                Address::sockaddr_len(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Starts listening with the OS-maximum backlog.
    pub fn listen(&self) -> io::Result<()> {
        let rc = unsafe { libc::listen(self.fd(), libc::SOMAXCONN) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accepts one pending connection.
    ///
    /// The returned socket is non-blocking and close-on-exec (`accept4`).
    /// `WouldBlock` means the accept burst is drained.
    pub fn accept(&self) -> io::Result<(Socket, Address)> {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = Address::sockaddr_len();
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let peer = Address::from_sockaddr_in(&sa);
        Ok((
            Self {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            },
            peer,
        ))
    }

    /// Returns the locally-bound address (resolves port 0 after bind).
    pub fn local_addr(&self) -> io::Result<Address> {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = Address::sockaddr_len();
        let rc = unsafe {
            libc::getsockname(
                self.fd(),
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Address::from_sockaddr_in(&sa))
    }

    /// Writes as much of `buf` as the kernel will take, retrying on EINTR.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::write(self.fd(), buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(n as usize);
        }
    }

    /// Half-closes the write direction.
    pub fn shutdown_write(&self) -> io::Result<()> {
        let rc = unsafe { libc::shutdown(self.fd(), libc::SHUT_WR) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sets `SO_REUSEADDR`, letting a restarted server rebind through
    /// TIME_WAIT remnants.
    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_flag(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    /// Sets `SO_REUSEPORT` for port sharing across processes.
    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_flag(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    /// Sets `SO_KEEPALIVE`.
    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.set_flag(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    /// Sets `TCP_NODELAY`, disabling Nagle's algorithm.
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_flag(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    /// Retrieves and clears the pending socket error (`SO_ERROR`).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut pending: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut pending as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if pending == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(pending)))
        }
    }

    fn set_flag(&self, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
        let value: libc::c_int = i32::from(on);
        let rc = unsafe {
            libc::setsockopt(
                self.fd(),
                level,
                opt,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
