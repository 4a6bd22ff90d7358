//! AF_PACKET raw transport bound to one interface and the lanlink
//! EtherType. Requires CAP_NET_RAW (or root).

use std::ffi::CString;
use std::io;
use std::mem;
use std::sync::Mutex;
use std::time::Instant;

use lanlink_core::frame::{MacAddr, ETHERTYPE};

/// Transport failures. The first three only occur at startup; send and
/// receive failures afterwards are reported as transport-error events.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("permission denied opening raw socket (CAP_NET_RAW required)")]
    PermissionDenied,
    #[error("socket setup failed: {0}")]
    Setup(#[source] io::Error),
    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),
    #[error("recv failed: {0}")]
    RecvFailed(#[source] io::Error),
}

/// Raw link-layer socket. The socket protocol argument makes the kernel
/// deliver only frames carrying our EtherType; binding to the interface
/// index restricts delivery to that interface. Sends are serialized by an
/// internal lock; receive is single-threaded by construction.
#[derive(Debug)]
pub struct RawSocket {
    fd: libc::c_int,
    local_mac: MacAddr,
    send_lock: Mutex<()>,
}

impl RawSocket {
    pub fn open(interface: &str) -> Result<RawSocket, TransportError> {
        if interface.is_empty() || interface.len() >= libc::IFNAMSIZ {
            return Err(TransportError::InterfaceNotFound(interface.to_string()));
        }
        let name = CString::new(interface)
            .map_err(|_| TransportError::InterfaceNotFound(interface.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(TransportError::InterfaceNotFound(interface.to_string()));
        }

        let proto = ETHERTYPE.to_be() as libc::c_int;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(code) if code == libc::EPERM || code == libc::EACCES => {
                    TransportError::PermissionDenied
                }
                _ => TransportError::Setup(err),
            });
        }
        // From here on the socket owns the fd; Drop closes it on error paths.
        let mut socket = RawSocket {
            fd,
            local_mac: MacAddr([0u8; 6]),
            send_lock: Mutex::new(()),
        };

        socket.local_mac = query_hwaddr(fd, &name).map_err(|err| match err.raw_os_error() {
            Some(code) if code == libc::ENODEV => {
                TransportError::InterfaceNotFound(interface.to_string())
            }
            _ => TransportError::Setup(err),
        })?;

        // Short receive timeout so the receive loop can observe shutdown.
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 500_000,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TransportError::Setup(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = ETHERTYPE.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(code) if code == libc::EPERM || code == libc::EACCES => {
                    TransportError::PermissionDenied
                }
                Some(code) if code == libc::ENODEV => {
                    TransportError::InterfaceNotFound(interface.to_string())
                }
                _ => TransportError::Setup(err),
            });
        }
        Ok(socket)
    }

    /// MAC of the bound interface, discovered at open.
    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    /// Put one already-encoded frame on the wire. Synchronous; no
    /// buffering, no retry.
    pub fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let _guard = self
            .send_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let rc = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(TransportError::SendFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Receive one frame. `Ok(None)` means the poll timeout elapsed with
    /// nothing to read; the caller checks its stop flag and calls again.
    pub fn recv(&self) -> Result<Option<(Vec<u8>, Instant)>, TransportError> {
        let mut buf = vec![0u8; 2048];
        let rc = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(TransportError::RecvFailed(err)),
            };
        }
        buf.truncate(rc as usize);
        Ok(Some((buf, Instant::now())))
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// SIOCGIFHWADDR: hardware address of a named interface.
fn query_hwaddr(fd: libc::c_int, name: &CString) -> io::Result<MacAddr> {
    #[repr(C)]
    struct IfreqHwaddr {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_hwaddr: libc::sockaddr,
    }

    let mut req: IfreqHwaddr = unsafe { mem::zeroed() };
    for (dst, &src) in req.ifr_name.iter_mut().zip(name.as_bytes_with_nul()) {
        *dst = src as libc::c_char;
    }
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut mac = [0u8; 6];
    for (dst, &src) in mac.iter_mut().zip(req.ifr_hwaddr.sa_data.iter()) {
        *dst = src as u8;
    }
    Ok(MacAddr(mac))
}
