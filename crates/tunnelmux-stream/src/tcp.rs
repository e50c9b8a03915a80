//! TCP implementation of the tunnel stream trait

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::transport::{Interest, Readiness, TunnelStream};

/// A TCP stream with poll-based readiness and socket-level timeouts
pub struct TcpTunnelStream {
    inner: TcpStream,
    timeout: Mutex<Duration>,
    closed: AtomicBool,
}

impl TcpTunnelStream {
    /// Wrap an already connected stream and apply `timeout` to reads,
    /// writes and default polls.
    pub fn new(stream: TcpStream, timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self {
            inner: stream,
            timeout: Mutex::new(timeout),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to `target` (`host:port` or `[ipv6]:port`), trying each
    /// resolved address with the given connect timeout.
    pub fn connect(target: &str, timeout: Duration) -> io::Result<Self> {
        let mut last_error = None;

        for addr in target.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::new(stream, timeout),
                Err(e) => {
                    debug!("connect to {} ({}) failed: {}", target, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address resolved for {}", target),
            )
        }))
    }
}

impl TunnelStream for TcpTunnelStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.inner).write_all(buf)?;
        (&self.inner).flush()
    }

    fn poll(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<Readiness> {
        let timeout = timeout.unwrap_or_else(|| *self.timeout.lock().unwrap());
        poll_fd(self.inner.as_raw_fd(), interest, timeout)
    }

    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        *self.timeout.lock().unwrap() = timeout;
        self.inner.set_read_timeout(Some(timeout))?;
        self.inner.set_write_timeout(Some(timeout))
    }

    fn is_good(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        matches!(self.inner.take_error(), Ok(None))
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.shutdown(Shutdown::Both);
        }
    }

    fn peer_addr(&self) -> String {
        self.inner
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}

/// poll(2) on one fd, retrying on EINTR within the deadline
fn poll_fd(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
    let events = match interest {
        Interest::Read => libc::POLLIN,
        Interest::Write => libc::POLLOUT,
    };
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;

        let mut pollfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };

        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if rc < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted && Instant::now() < deadline {
                continue;
            }
            return Err(error);
        }

        let revents = pollfd.revents;
        return Ok(Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            hung_up: revents & libc::POLLHUP != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        });
    }
}
