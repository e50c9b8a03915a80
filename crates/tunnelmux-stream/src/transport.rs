//! Stream trait for tunnel transports and direct connections

use std::io;
use std::time::Duration;

/// What to wait for when polling a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Outcome of a readiness poll. All fields false means the poll timed out
/// with nothing to report.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hung_up: bool,
    pub error: bool,
}

impl Readiness {
    /// true if the poll timed out without any event
    pub fn is_idle(&self) -> bool {
        !(self.readable || self.writable || self.hung_up || self.error)
    }
}

/// A bidirectional byte stream usable from several threads at once.
///
/// Reads and writes take `&self` so that one thread can pump each direction
/// of the same stream. Implementations serialize nothing beyond what the
/// underlying resource requires; callers own any higher-level locking.
pub trait TunnelStream: Send + Sync {
    /// Read up to `buf.len()` bytes. Blocks up to the configured timeout;
    /// a timeout surfaces as an error, end of stream as `Ok(0)`.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer, or fail. Blocks up to the configured timeout.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Wait until the stream is ready for `interest`; hangup and error
    /// conditions are reported alongside. `None` waits up to the stream's
    /// configured timeout, `Some(Duration::ZERO)` only inspects the current
    /// state.
    fn poll(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<Readiness>;

    /// Set the timeout used for blocking reads, writes and polls
    fn set_timeout(&self, timeout: Duration) -> io::Result<()>;

    /// true while the stream is usable for reading and writing
    fn is_good(&self) -> bool;

    /// Tear the stream down. Idempotent; wakes blocked peers.
    fn shutdown(&self);

    /// human-readable address of the other end, for log lines
    fn peer_addr(&self) -> String;
}

// Adapters so the wire codec, which works on `io::Read`/`io::Write`, can
// consume any `&dyn TunnelStream`.

impl io::Read for &dyn TunnelStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TunnelStream::read(*self, buf)
    }
}

impl io::Write for &dyn TunnelStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TunnelStream::write_all(*self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
