//! The tunnel engine
//!
//! Owns the single transport stream, runs the login handshake, serializes
//! transport access, keeps the tunnel alive through quiet periods, and
//! dispatches incoming messages to the right connection or control handler.
//!
//! The control and data streams between the two tunnel endpoints are
//! multiplexed over that one stream: channel 0 carries control messages,
//! channels from 1 upward carry end-to-end connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use tunnelmux_proto::{ChannelId, Message, MessageKind, CONTROL_CHANNEL};
use tunnelmux_stream::{Interest, TcpTunnelStream, TunnelStream};

use crate::config::Config;
use crate::connection::TunnelSender;
use crate::error::EngineError;
use crate::registry::Connections;

/// cadence of the timer thread
const TIMER_TICK: Duration = Duration::from_millis(250);
/// lower edge of the quiet window that triggers an idle keepalive
const IDLE_AFTER: Duration = Duration::from_millis(500);
/// upper edge of the window; beyond it the periodic ping takes over
const IDLE_WINDOW_END: Duration = Duration::from_millis(1600);
/// debounce between idle notifications and after data traffic
const IDLE_DEBOUNCE: Duration = Duration::from_millis(500);
/// size of the round-trip timing token in a Ping/Pong payload
const PING_TOKEN_LEN: usize = 16;

/// Login credentials for the side establishing the tunnel
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }
}

struct IdleState {
    last_tx: Instant,
    send_idle_not_before: Instant,
}

/// One end of a multiplexed tunnel.
///
/// Construct both ends around an already connected transport stream; the
/// instance given credentials logs in at the other one. Afterwards run the
/// dispatch loop with [`run`](Tunnel::run) and open multiplexed streams
/// with [`connect`](Tunnel::connect) from either side.
pub struct Tunnel {
    config: Config,
    stream: Arc<dyn TunnelStream>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    idle: Mutex<IdleState>,
    connections: Connections,
    mask_tx: bool,
    is_initiator: bool,
    rtt: Mutex<Option<Duration>>,
    quit: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// handle to ourselves for send callbacks and worker threads
    weak: Weak<Tunnel>,
}

impl Tunnel {
    /// Establish a tunnel around an open transport stream.
    ///
    /// With `credentials` this side initiates: it masks its frames like a
    /// WebSocket client (unless `never_mask`), sends a `Login` and expects
    /// a `Helo` back. Without credentials this side responds: it waits for
    /// a `Login` and accepts only secrets from `config.secrets`. On success
    /// the tunnel timer is running and the instance is ready for `run()`.
    pub fn new(
        config: Config,
        stream: Arc<dyn TunnelStream>,
        credentials: Option<Credentials>,
        never_mask: bool,
    ) -> Result<Arc<Self>, EngineError> {
        let is_initiator = credentials.is_some();
        let now = Instant::now();

        let tunnel = Arc::new_cyclic(|weak| Self {
            connections: Connections::new(config.max_connections),
            stream,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            idle: Mutex::new(IdleState {
                last_tx: now,
                send_idle_not_before: now,
            }),
            mask_tx: is_initiator && !never_mask,
            is_initiator,
            rtt: Mutex::new(None),
            quit: AtomicBool::new(false),
            timer: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            weak: weak.clone(),
            config,
        });

        match credentials {
            Some(credentials) => {
                if !tunnel.login(&credentials)? {
                    return Err(EngineError::LoginFailed);
                }
            }
            None => tunnel.wait_for_login()?,
        }

        tunnel.stream.set_timeout(tunnel.tunnel_timeout())?;

        let timer = {
            let weak = Arc::downgrade(&tunnel);
            thread::spawn(move || Self::timer_loop(weak))
        };
        *tunnel.timer.lock().unwrap() = Some(timer);

        Ok(tunnel)
    }

    /// the ip address of the opposite tunnel endpoint
    pub fn peer_addr(&self) -> String {
        self.stream.peer_addr()
    }

    /// round-trip time measured by the most recent control ping
    pub fn rtt(&self) -> Option<Duration> {
        *self.rtt.lock().unwrap()
    }

    /// current count of multiplexed connections
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Shut the tunnel down: stops the timer, closes the transport and
    /// disconnects every multiplexed connection.
    pub fn close(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.stream.shutdown();
        for connection in self.connections.drain() {
            connection.disconnect();
        }
    }

    /// true if the transport stream is still good for reading and writing
    fn have_tunnel(&self) -> bool {
        !self.quit.load(Ordering::SeqCst) && self.stream.is_good()
    }

    /// read and write timeout of the established tunnel; both ends derive
    /// it from the same config values
    fn tunnel_timeout(&self) -> Duration {
        self.config.control_ping + self.config.connect_timeout
    }

    /// a send handle for connections; holds the engine weakly so orphaned
    /// connections cannot keep it alive
    fn sender(&self) -> TunnelSender {
        let weak = self.weak.clone();
        Arc::new(move |message: Message| match weak.upgrade() {
            Some(tunnel) => tunnel.write_message(message),
            None => Err(EngineError::TransportGone),
        })
    }

    /// Read one message off the shared transport.
    ///
    /// Two phases: wait for readiness without holding the read lock, then
    /// reacquire and re-verify with a zero-timeout poll before decoding, so
    /// a slow peer never stalls the transport lock. Bounded by an overall
    /// deadline of one tunnel timeout.
    fn read_message(&self) -> Result<Message, EngineError> {
        let deadline = Instant::now() + self.tunnel_timeout();

        loop {
            // return latest after the stream timeout
            let ready = self.stream.poll(Interest::Read, None)?;
            if !ready.readable {
                if ready.hung_up || ready.error {
                    return Err(EngineError::TransportGone);
                }
                return Err(EngineError::Timeout);
            }

            {
                let _guard = self.read_lock.lock().unwrap();

                // return immediately from the poll: readiness may be stale
                // if another reader won the lock in between
                if self.stream.poll(Interest::Read, Some(Duration::ZERO))?.readable {
                    let message = Message::read_from(&mut &*self.stream)?;
                    trace!("{}", message);
                    return Ok(message);
                }
            }

            if Instant::now() >= deadline {
                return Err(EngineError::Timeout);
            }
            // the stream changed state while acquiring the lock, poll again
        }
    }

    /// Write one message to the shared transport, with the same two-phase
    /// locking as `read_message`. Successful `Data` and `Idle` writes feed
    /// the idle-keepalive bookkeeping.
    fn write_message(&self, mut message: Message) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.tunnel_timeout();

        loop {
            let ready = self.stream.poll(Interest::Write, None)?;
            if !ready.writable {
                if ready.hung_up || ready.error {
                    return Err(EngineError::TransportGone);
                }
                return Err(EngineError::Timeout);
            }

            {
                let _guard = self.write_lock.lock().unwrap();

                if self.stream.poll(Interest::Write, Some(Duration::ZERO))?.writable {
                    trace!("{}", message);
                    let kind = message.kind();
                    message.write_to(&mut &*self.stream, self.mask_tx)?;

                    // Data resets the quiet clock; an Idle only pushes the
                    // debounce so the window can close and the periodic
                    // ping takes over
                    if kind == MessageKind::Data {
                        let mut idle = self.idle.lock().unwrap();
                        idle.last_tx = Instant::now();
                        idle.send_idle_not_before = idle.last_tx + IDLE_DEBOUNCE;
                    } else if kind == MessageKind::Idle {
                        let mut idle = self.idle.lock().unwrap();
                        idle.send_idle_not_before = Instant::now() + IDLE_DEBOUNCE;
                    }

                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(EngineError::Timeout);
            }
        }
    }

    /// log in at the opposite instance; true on a proper `Helo`
    fn login(&self, credentials: &Credentials) -> Result<bool, EngineError> {
        let token = BASE64.encode(format!("{}:{}", credentials.user, credentials.secret));
        self.write_message(Message::control_with(MessageKind::Login, token.into_bytes()))?;

        // wait for the response
        let response = self.read_message()?;
        if response.kind() != MessageKind::Helo || response.channel() != CONTROL_CHANNEL {
            return Ok(false);
        }

        debug!("logged in at {}", self.peer_addr());
        Ok(true)
    }

    /// wait for the other tunnel side to log in
    fn wait_for_login(&self) -> Result<(), EngineError> {
        let login = self.read_message()?;

        if login.kind() != MessageKind::Login {
            debug!(
                "expected login from {}, got {}",
                self.peer_addr(),
                login.kind().as_str()
            );
            return Err(EngineError::ExpectedLogin(login.kind().as_str()));
        }

        let decoded = BASE64
            .decode(login.payload())
            .map_err(|_| EngineError::MalformedLogin)?;
        let decoded = String::from_utf8(decoded).map_err(|_| EngineError::MalformedLogin)?;

        // name:secret, like in basic auth; without a colon the whole
        // payload is the secret
        let (name, secret) = match decoded.find(':') {
            Some(pos) => (&decoded[..pos], &decoded[pos + 1..]),
            None => ("", decoded.as_str()),
        };

        if self.config.secrets.is_empty() || !self.config.secrets.contains(secret) {
            return Err(EngineError::InvalidSecret(self.peer_addr()));
        }

        // finally say hi
        self.write_message(Message::control(MessageKind::Helo))?;
        debug!("successful login from {} ({}) with secret", self.peer_addr(), name);
        Ok(())
    }

    /// Run the event handler for this tunnel. Blocks the calling thread
    /// until the transport goes away; protocol violations return an error.
    pub fn run(&self) -> Result<(), EngineError> {
        while self.have_tunnel() {
            let mut message = self.read_message()?;

            trace!("open connections: {}", self.connections.len());

            let channel = message.channel();

            match message.kind() {
                MessageKind::Ping => {
                    // check if the channel is alive on our end
                    if channel == CONTROL_CHANNEL || self.connections.exists(channel) {
                        // respond with pong
                        message.set_kind(MessageKind::Pong);
                        self.write_message(message)?;
                    } else {
                        self.write_message(Message::disconnect(channel)?)?;
                    }
                }

                MessageKind::Pong => {
                    // do nothing, but note the round trip
                    if let Some(rtt) = decode_ping_token(message.payload()) {
                        debug!("roundtrip: {:?}", rtt);
                        *self.rtt.lock().unwrap() = Some(rtt);
                    }
                }

                MessageKind::Idle => {
                    // really do nothing
                }

                MessageKind::Control => {
                    if channel != CONTROL_CHANNEL {
                        return Err(EngineError::ControlOnDataChannel(channel));
                    }
                    // we currently do not exchange control messages
                }

                MessageKind::Connect if channel == CONTROL_CHANNEL => {
                    // end-to-end streams live on channels from 1 upward
                    warn!("got connect request on the control channel");
                    self.write_message(Message::disconnect(channel)?)?;
                }

                MessageKind::Connect => {
                    // open a new stream to the requested endpoint
                    match std::str::from_utf8(message.payload()) {
                        Ok(target) => {
                            let target = target.to_string();
                            debug!("got connect request: {} for channel {}", target, channel);

                            match self.connections.create(channel, self.sender(), None) {
                                Ok(_) => match self.weak.upgrade() {
                                    Some(tunnel) => self.spawn_worker(move || {
                                        tunnel.connect_to_target(channel, target)
                                    }),
                                    // mid-teardown; the entry is reaped by close()
                                    None => {}
                                },
                                Err(e) => {
                                    debug!("refusing connect for channel {}: {}", channel, e);
                                    self.write_message(Message::disconnect(channel)?)?;
                                }
                            }
                        }
                        Err(_) => {
                            warn!("[{}]: connect request with undecodable target", channel);
                            self.write_message(Message::disconnect(channel)?)?;
                        }
                    }
                }

                MessageKind::Data => match self.connections.get(channel) {
                    Some(connection) => connection.send_data(message)?,
                    None => self.write_message(Message::disconnect(channel)?)?,
                },

                MessageKind::Pause => match self.connections.get(channel) {
                    Some(connection) => connection.pause(),
                    None => self.write_message(Message::disconnect(channel)?)?,
                },

                MessageKind::Resume => match self.connections.get(channel) {
                    Some(connection) => connection.resume(),
                    None => self.write_message(Message::disconnect(channel)?)?,
                },

                MessageKind::Disconnect => {
                    if let Some(connection) = self.connections.get(channel) {
                        // put the disconnect into the queue so it acts only
                        // after the data queued before it
                        connection.send_data(message)?;
                    }
                }

                MessageKind::Login | MessageKind::Helo => {
                    return Err(EngineError::UnexpectedHandshakeMessage);
                }

                MessageKind::None => return Err(EngineError::InvalidMessageKind),
            }
        }

        Ok(())
    }

    /// Connect an incoming direct stream with the tunnel and the given
    /// endpoint on the other side. Returns after the connection is closed
    /// from either end.
    pub fn connect(&self, direct: Arc<dyn TunnelStream>, target: &str) -> Result<(), EngineError> {
        if !direct.is_good() {
            return Err(EngineError::BadDirectStream);
        }

        let connection = self
            .connections
            .create(0, self.sender(), Some(direct.clone()))?;
        let id = connection.id();

        self.write_message(Message::new(
            MessageKind::Connect,
            id,
            Bytes::copy_from_slice(target.as_bytes()),
        )?)?;
        debug!("[{}]: requested forward connection to {}", id, target);

        let pump = {
            let connection = connection.clone();
            thread::spawn(move || connection.pump_from_tunnel())
        };
        connection.pump_to_tunnel();
        if pump.join().is_err() {
            warn!("[{}]: pump thread panicked", id);
        }

        self.connections.take(id);
        debug!("[{}]: closed forward stream from {}", id, direct.peer_addr());
        Ok(())
    }

    /// Worker body for an inbound connect request: opens the outbound
    /// connection and runs both pumps. Errors are logged, never propagated;
    /// the registry entry goes away regardless of the outcome.
    fn connect_to_target(self: Arc<Self>, id: ChannelId, target: String) {
        if let Some(connection) = self.connections.get(id) {
            debug!("connecting {}..", target);

            match TcpTunnelStream::connect(&target, self.config.connect_timeout) {
                Ok(stream) => {
                    let stream: Arc<dyn TunnelStream> = Arc::new(stream);
                    if stream.set_timeout(self.config.timeout).is_err() {
                        warn!("[{}]: cannot set timeout on target stream", id);
                    }

                    if connection.bind_direct_stream(stream) {
                        let pump = {
                            let connection = connection.clone();
                            thread::spawn(move || connection.pump_from_tunnel())
                        };
                        connection.pump_to_tunnel();
                        if pump.join().is_err() {
                            warn!("[{}]: pump thread panicked", id);
                        }
                    } else {
                        warn!("[{}]: direct stream already bound", id);
                    }
                }
                Err(e) => {
                    debug!("cannot connect to target {}: {}", target, e);
                }
            }

            // should this not yet have been done
            connection.disconnect();
        } else {
            debug!("cannot find connection {}", id);
        }

        self.connections.remove(id);
    }

    /// register a fire-and-forget worker thread, reaping finished ones
    fn spawn_worker(&self, work: impl FnOnce() + Send + 'static) {
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|handle| !handle.is_finished());
        workers.push(thread::spawn(work));
    }

    /// Timer loop: wakes every tick, sends one `Idle` when the tunnel has
    /// been quiet for the keepalive window, and fires the periodic control
    /// ping on the initiating side. Holds the engine only weakly so it
    /// never keeps a dropped tunnel alive.
    fn timer_loop(tunnel: Weak<Self>) {
        let mut last_ping = Instant::now();

        loop {
            thread::sleep(TIMER_TICK);

            let Some(tunnel) = tunnel.upgrade() else {
                return;
            };
            if tunnel.quit.load(Ordering::SeqCst) {
                return;
            }

            let mut send_idle = false;
            {
                let idle = tunnel.idle.lock().unwrap();
                let now = Instant::now();
                let quiet = now.duration_since(idle.last_tx);

                if quiet >= IDLE_AFTER
                    && quiet <= IDLE_WINDOW_END
                    && idle.send_idle_not_before <= now
                {
                    send_idle = true;
                }
            }

            if send_idle {
                if let Err(e) = tunnel.write_message(Message::control(MessageKind::Idle)) {
                    debug!("idle keepalive failed: {}", e);
                }
            }

            if tunnel.is_initiator && last_ping.elapsed() >= tunnel.config.control_ping {
                last_ping = Instant::now();
                tunnel.ping_test();
            }
        }
    }

    /// force a ping to check the tunnel; the pong carries the token back
    fn ping_test(&self) {
        if !self.have_tunnel() {
            return;
        }
        if let Err(e) = self.write_message(Message::control_with(MessageKind::Ping, ping_token())) {
            debug!("control ping failed: {}", e);
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();

        let current = thread::current().id();

        if let Some(timer) = self.timer.lock().unwrap().take() {
            if timer.thread().id() != current {
                let _ = timer.join();
            }
        }

        // a worker may be the thread dropping the last handle; never join
        // ourselves
        for worker in self.workers.lock().unwrap().drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

/// current time as an opaque 16-byte token for Ping payloads
fn ping_token() -> Bytes {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Bytes::copy_from_slice(&nanos.to_be_bytes())
}

/// Round trip measured against a returned ping token; `None` when the
/// payload does not look like one.
fn decode_ping_token(payload: &[u8]) -> Option<Duration> {
    let bytes: [u8; PING_TOKEN_LEN] = payload.try_into().ok()?;
    let sent = u128::from_be_bytes(bytes);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_nanos();
    let elapsed = now.checked_sub(sent)?;
    Some(Duration::from_nanos(u64::try_from(elapsed).ok()?))
}
