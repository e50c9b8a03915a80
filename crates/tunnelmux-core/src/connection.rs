//! One multiplexed connection and its two data pumps
//!
//! A `Connection` bridges one direct byte stream with its channel inside
//! the tunnel. Two threads pump it: `pump_to_tunnel` reads the direct
//! stream and sends `Data` messages, `pump_from_tunnel` drains the inbound
//! queue into the direct stream. Flow control is a bounded queue plus
//! `Pause`/`Resume` signaling per channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use tunnelmux_proto::{ChannelId, Message, MessageKind};
use tunnelmux_stream::{Interest, TunnelStream};

use crate::error::EngineError;

/// max size for the message queue of one connection
pub const MAX_MESSAGE_QUEUE_SIZE: usize = 20;

/// read chunk for the direct-stream pump
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Sends a message into the tunnel on behalf of a connection
pub type TunnelSender = Arc<dyn Fn(Message) -> Result<(), EngineError> + Send + Sync>;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Message>,
    /// we asked the peer to stop sending because our queue filled up
    rx_paused: bool,
}

/// Runs one single connection in the multiplexed tunnel.
///
/// Shared between the registry and the two pump threads; the last owner
/// drops it after both pumps have exited and the registry entry is gone.
pub struct Connection {
    id: ChannelId,
    tunnel: TunnelSender,
    direct: OnceLock<Arc<dyn TunnelStream>>,
    state: Mutex<QueueState>,
    fresh_data: Condvar,
    /// the peer asked us to stop sending Data for this channel
    paused: Mutex<bool>,
    resume_tx: Condvar,
    quit: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: ChannelId,
        tunnel: TunnelSender,
        direct: Option<Arc<dyn TunnelStream>>,
    ) -> Self {
        let slot = OnceLock::new();
        if let Some(stream) = direct {
            let _ = slot.set(stream);
        }
        Self {
            id,
            tunnel,
            direct: slot,
            state: Mutex::new(QueueState::default()),
            fresh_data: Condvar::new(),
            paused: Mutex::new(false),
            resume_tx: Condvar::new(),
            quit: AtomicBool::new(false),
        }
    }

    /// the unique id (channel) for this connection
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Bind the direct stream if it was not given at creation. Returns
    /// false if one is already bound.
    pub fn bind_direct_stream(&self, stream: Arc<dyn TunnelStream>) -> bool {
        self.direct.set(stream).is_ok()
    }

    /// pause sending Data frames for this channel
    pub fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    /// resume sending Data frames for this channel
    pub fn resume(&self) {
        let mut paused = self.paused.lock().unwrap();
        if !*paused {
            // nothing to wake up
            return;
        }
        *paused = false;
        self.resume_tx.notify_one();
    }

    /// check if this connection shall hold back Data frames
    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    fn quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Shut this connection down. Idempotent; wakes both pumps and closes
    /// the direct stream if one is bound.
    pub fn disconnect(&self) {
        self.quit.store(true, Ordering::SeqCst);

        {
            let _state = self.state.lock().unwrap();
            self.fresh_data.notify_all();
        }
        {
            let _paused = self.paused.lock().unwrap();
            self.resume_tx.notify_all();
        }

        if let Some(direct) = self.direct.get() {
            direct.shutdown();
        }
    }

    /// Queue a message arriving from the tunnel for delivery to the direct
    /// stream. Requests a pause from the peer when the queue runs full.
    pub fn send_data(&self, message: Message) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();

        trace!("[{}]: queued {} bytes", self.id, message.len());
        state.queue.push_back(message);

        if !state.rx_paused && state.queue.len() >= MAX_MESSAGE_QUEUE_SIZE {
            (self.tunnel)(Message::new(MessageKind::Pause, self.id, Bytes::new())?)?;
            state.rx_paused = true;
            debug!("[{}]: requested pause", self.id);
        }

        self.fresh_data.notify_one();
        Ok(())
    }

    /// Runs the data pump into the tunnel. Returns once the direct stream
    /// times out, hangs up or errors; a `Disconnect` for this channel is
    /// sent through the tunnel on the way out. Errors are logged, never
    /// propagated.
    pub fn pump_to_tunnel(&self) {
        let Some(direct) = self.direct.get() else {
            return;
        };

        if let Err(e) = self.pump_to_tunnel_inner(direct.as_ref()) {
            debug!("[{}]: pump to tunnel: {}", self.id, e);
        }

        // tell the other side, whatever ended the loop
        match Message::disconnect(self.id) {
            Ok(message) => {
                if let Err(e) = (self.tunnel)(message) {
                    debug!("[{}]: cannot send disconnect: {}", self.id, e);
                }
            }
            Err(e) => debug!("[{}]: {}", self.id, e),
        }
    }

    fn pump_to_tunnel_inner(&self, direct: &dyn TunnelStream) -> Result<(), EngineError> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        // read until disconnect or timeout
        loop {
            let ready = direct.poll(Interest::Read, None)?;

            if ready.is_idle() {
                debug!("[{}]: timeout from {}", self.id, direct.peer_addr());
                break;
            }

            if ready.readable {
                if self.is_paused() {
                    debug!("[{}]: paused", self.id);
                    // hold off until the peer lets us send again; the
                    // predicate guards against spurious wakeups
                    let guard = self.paused.lock().unwrap();
                    drop(
                        self.resume_tx
                            .wait_while(guard, |paused| *paused && !self.quitting())
                            .unwrap(),
                    );
                    debug!("[{}]: unpaused", self.id);
                    if self.quitting() {
                        break;
                    }
                    // now poll again to see if the input stream is still there
                    continue;
                }

                let n = direct.read(&mut buf)?;
                trace!("[{}]: {}: read {} bytes", self.id, direct.peer_addr(), n);

                if n > 0 {
                    (self.tunnel)(Message::data(self.id, Bytes::copy_from_slice(&buf[..n]))?)?;
                } else {
                    debug!("[{}]: disconnected from {}", self.id, direct.peer_addr());
                    break;
                }
            }

            if ready.hung_up || ready.error {
                debug!("[{}]: got disconnected from {}", self.id, direct.peer_addr());
                break;
            }
        }

        Ok(())
    }

    /// Runs the data pump out of the tunnel: drains the inbound queue in
    /// FIFO order into the direct stream until a `Disconnect` is processed
    /// or the stream fails. Errors are logged, never propagated; a failed
    /// connection is shut down.
    pub fn pump_from_tunnel(&self) {
        let Some(direct) = self.direct.get() else {
            warn!("[{}]: no stream for channel", self.id);
            return;
        };

        if let Err(e) = self.pump_from_tunnel_inner(direct.as_ref()) {
            debug!("[{}]: pump from tunnel: {}", self.id, e);
            self.disconnect();
        }
    }

    fn pump_from_tunnel_inner(&self, direct: &dyn TunnelStream) -> Result<(), EngineError> {
        loop {
            let mut state = self.state.lock().unwrap();
            let mut saw_disconnect = false;

            while let Some(kind) = state.queue.front().map(|m| m.kind()) {
                match kind {
                    MessageKind::Data => {
                        // check if we can write right away
                        if !direct.poll(Interest::Write, Some(Duration::ZERO))?.writable {
                            // no - get out of the lock and wait until the
                            // timeout for write readiness
                            drop(state);
                            if !direct.poll(Interest::Write, None)?.writable {
                                return Err(EngineError::DirectWriteFailed(self.id));
                            }
                            state = self.state.lock().unwrap();
                        }
                        if let Some(message) = state.queue.front() {
                            direct.write_all(message.payload())?;
                            trace!(
                                "[{}]: {}: wrote {} bytes",
                                self.id,
                                direct.peer_addr(),
                                message.len()
                            );
                        }
                    }
                    MessageKind::Disconnect => {
                        debug!("[{}]: got disconnect frame for {}", self.id, direct.peer_addr());
                        saw_disconnect = true;
                    }
                    other => {
                        // only Data and Disconnect are ever queued
                        warn!("[{}]: dropping queued {} message", self.id, other.as_str());
                    }
                }

                state.queue.pop_front();

                // check if we had formerly sent a Pause frame, and have
                // room in the queue again
                if state.rx_paused && state.queue.len() < MAX_MESSAGE_QUEUE_SIZE / 2 {
                    (self.tunnel)(Message::new(MessageKind::Resume, self.id, Bytes::new())?)?;
                    state.rx_paused = false;
                    debug!("[{}]: requested resume", self.id);
                }

                if saw_disconnect {
                    break;
                }
            }

            drop(state);

            if saw_disconnect {
                self.disconnect();
            }
            if self.quitting() {
                break;
            }

            // wait for new data coming in
            let state = self.state.lock().unwrap();
            drop(
                self.fresh_data
                    .wait_while(state, |s| s.queue.is_empty() && !self.quitting())
                    .unwrap(),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use tunnelmux_stream::memory;

    /// a tunnel sender that records everything it is given
    fn recording_sender() -> (TunnelSender, Arc<StdMutex<Vec<Message>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = sent.clone();
        let sender: TunnelSender = Arc::new(move |message: Message| {
            sink.lock().unwrap().push(message);
            Ok(())
        });
        (sender, sent)
    }

    fn kinds(sent: &Arc<StdMutex<Vec<Message>>>) -> Vec<MessageKind> {
        sent.lock().unwrap().iter().map(|m| m.kind()).collect()
    }

    #[test]
    fn test_queue_bound_requests_exactly_one_pause() {
        let (sender, sent) = recording_sender();
        let connection = Connection::new(5, sender, None);

        for i in 0..MAX_MESSAGE_QUEUE_SIZE {
            connection
                .send_data(Message::data(5, Bytes::from(vec![i as u8])).unwrap())
                .unwrap();
        }

        let pauses = kinds(&sent)
            .iter()
            .filter(|k| **k == MessageKind::Pause)
            .count();
        assert_eq!(pauses, 1);

        // further pushes while paused do not repeat the request
        connection
            .send_data(Message::data(5, Bytes::from_static(b"x")).unwrap())
            .unwrap();
        let pauses = kinds(&sent)
            .iter()
            .filter(|k| **k == MessageKind::Pause)
            .count();
        assert_eq!(pauses, 1);

        let pause = &sent.lock().unwrap()[0];
        assert_eq!(pause.channel(), 5);
    }

    #[test]
    fn test_drain_sends_exactly_one_resume_and_keeps_fifo_order() {
        let (sender, sent) = recording_sender();
        let (direct, far_end) = memory::duplex();
        let connection = Arc::new(Connection::new(
            7,
            sender,
            Some(Arc::new(direct) as Arc<dyn TunnelStream>),
        ));

        // fill the queue to the bound before the pump runs, then append the
        // disconnect that ends the pump
        let mut expected = Vec::new();
        for i in 0..MAX_MESSAGE_QUEUE_SIZE {
            let payload = vec![i as u8; 3];
            expected.extend_from_slice(&payload);
            connection
                .send_data(Message::data(7, Bytes::from(payload)).unwrap())
                .unwrap();
        }
        connection
            .send_data(Message::disconnect(7).unwrap())
            .unwrap();

        let pump = {
            let connection = connection.clone();
            thread::spawn(move || connection.pump_from_tunnel())
        };
        pump.join().unwrap();

        // everything arrived, byte for byte, in push order
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match far_end.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(received, expected);

        let kinds = kinds(&sent);
        let pauses = kinds.iter().filter(|k| **k == MessageKind::Pause).count();
        let resumes = kinds.iter().filter(|k| **k == MessageKind::Resume).count();
        assert_eq!(pauses, 1);
        assert_eq!(resumes, 1);

        // the disconnect was processed after all the data
        assert!(!far_end.is_good());
    }

    #[test]
    fn test_pause_blocks_pump_until_resume() {
        let (sender, sent) = recording_sender();
        let (direct, far_end) = memory::duplex();
        direct.set_timeout(Duration::from_secs(5)).unwrap();
        let connection = Arc::new(Connection::new(
            3,
            sender,
            Some(Arc::new(direct) as Arc<dyn TunnelStream>),
        ));

        connection.pause();
        assert!(connection.is_paused());

        far_end.write_all(b"held back").unwrap();

        let pump = {
            let connection = connection.clone();
            thread::spawn(move || connection.pump_to_tunnel())
        };

        // the pump sees readable data but must hold off while paused
        thread::sleep(Duration::from_millis(100));
        assert!(kinds(&sent).is_empty());

        connection.resume();
        thread::sleep(Duration::from_millis(100));

        let snapshot = kinds(&sent);
        assert_eq!(snapshot.first(), Some(&MessageKind::Data));

        // hang up the far end so the pump finishes with a disconnect
        far_end.shutdown();
        pump.join().unwrap();
        assert_eq!(kinds(&sent).last(), Some(&MessageKind::Disconnect));
    }

    #[test]
    fn test_pump_to_tunnel_reports_disconnect_on_timeout() {
        let (sender, sent) = recording_sender();
        let (direct, _far_end) = memory::duplex();
        direct.set_timeout(Duration::from_millis(50)).unwrap();
        let connection = Connection::new(
            9,
            sender,
            Some(Arc::new(direct) as Arc<dyn TunnelStream>),
        );

        connection.pump_to_tunnel();

        assert_eq!(kinds(&sent), vec![MessageKind::Disconnect]);
        assert_eq!(sent.lock().unwrap()[0].channel(), 9);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (sender, sent) = recording_sender();
        let (direct, far_end) = memory::duplex();
        let connection = Connection::new(
            2,
            sender,
            Some(Arc::new(direct) as Arc<dyn TunnelStream>),
        );

        connection.disconnect();
        connection.disconnect();
        connection.disconnect();

        assert!(!far_end.is_good());
        // disconnect() itself never emits messages
        assert!(kinds(&sent).is_empty());
    }

    #[test]
    fn test_disconnect_wakes_a_paused_pump() {
        let (sender, _sent) = recording_sender();
        let (direct, far_end) = memory::duplex();
        direct.set_timeout(Duration::from_secs(5)).unwrap();
        let connection = Arc::new(Connection::new(
            4,
            sender,
            Some(Arc::new(direct) as Arc<dyn TunnelStream>),
        ));

        connection.pause();
        far_end.write_all(b"data").unwrap();

        let pump = {
            let connection = connection.clone();
            thread::spawn(move || connection.pump_to_tunnel())
        };

        thread::sleep(Duration::from_millis(100));
        connection.disconnect();

        // the paused pump exits promptly instead of waiting out the timeout
        pump.join().unwrap();
    }
}
