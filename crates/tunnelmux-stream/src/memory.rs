//! In-memory duplex stream pair
//!
//! Two [`MemoryStream`]s connected back to back, for tests that need a
//! transport or a direct stream without touching the network.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::transport::{Interest, Readiness, TunnelStream};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-memory duplex connection
pub struct MemoryStream {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    timeout: Mutex<Duration>,
}

/// Create a connected pair of in-memory streams
pub fn duplex() -> (MemoryStream, MemoryStream) {
    let a = Arc::new(Pipe::default());
    let b = Arc::new(Pipe::default());

    (
        MemoryStream {
            rx: a.clone(),
            tx: b.clone(),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
        },
        MemoryStream {
            rx: b,
            tx: a,
            timeout: Mutex::new(DEFAULT_TIMEOUT),
        },
    )
}

impl MemoryStream {
    fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap()
    }
}

impl TunnelStream for MemoryStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.rx.state.lock().unwrap();
        let (mut state, _) = self
            .rx
            .readable
            .wait_timeout_while(state, self.timeout(), |s| s.buf.is_empty() && !s.closed)
            .unwrap();

        if state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }

        let n = buf.len().min(state.buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.buf.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.tx.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buf.extend(buf);
        self.tx.readable.notify_all();
        Ok(())
    }

    fn poll(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<Readiness> {
        let timeout = timeout.unwrap_or_else(|| self.timeout());

        match interest {
            Interest::Write => {
                let state = self.tx.state.lock().unwrap();
                if state.closed {
                    Ok(Readiness {
                        hung_up: true,
                        ..Readiness::default()
                    })
                } else {
                    Ok(Readiness {
                        writable: true,
                        ..Readiness::default()
                    })
                }
            }
            Interest::Read => {
                let state = self.rx.state.lock().unwrap();
                let (state, _) = self
                    .rx
                    .readable
                    .wait_timeout_while(state, timeout, |s| s.buf.is_empty() && !s.closed)
                    .unwrap();

                if state.buf.is_empty() && !state.closed {
                    return Ok(Readiness::default());
                }
                Ok(Readiness {
                    // end of stream counts as readable, the read returns 0
                    readable: true,
                    hung_up: state.closed,
                    ..Readiness::default()
                })
            }
        }
    }

    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        *self.timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn is_good(&self) -> bool {
        !self.rx.state.lock().unwrap().closed && !self.tx.state.lock().unwrap().closed
    }

    fn shutdown(&self) {
        self.rx.close();
        self.tx.close();
    }

    fn peer_addr(&self) -> String {
        "memory".to_string()
    }
}
