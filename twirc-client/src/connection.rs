//! Connection engine.
//!
//! One [`Connection`] owns the socket and two background tasks:
//! - the read loop reassembles lines from partial reads and routes them
//! - the write loop drains the channel queues round-robin, one message per
//!   queue per pass, holding non-system queues until end of MOTD (376)
//!
//! Both loops stop when the state leaves `Authenticating`/`Connected`.

use crate::channel::{ChannelQueue, SYSTEM_CHANNEL};
use crate::config::Credentials;
use crate::error::ClientError;
use crate::router::{HandlerError, MessageHandler, Router};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use twirc_protocol::command::{JOIN, NICK, PASS, PRIVMSG, USER};
use twirc_protocol::{encode_line, irc_lower, LineDecoder, Message};

/// Default socket read size.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 512;

/// Minimum socket read size.
pub const MIN_READ_CHUNK_SIZE: usize = 64;

/// Maximum socket read size (64 KiB).
pub const MAX_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Who to log in as and where.
    pub credentials: Credentials,
    /// Bytes requested per socket read.
    pub read_chunk_size: usize,
    /// Capacity of every channel queue, system queue included.
    pub max_queued_per_channel: usize,
    /// Outbound lines are cut to this many characters.
    pub max_line_length: usize,
    /// Flood-control window per channel.
    pub flood_window: Duration,
    /// Messages admitted per channel within `flood_window`.
    pub flood_max_messages: usize,
    /// Hold channel queues until end of MOTD is seen.
    pub wait_for_motd: bool,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Longest single wait on socket readability before re-checking state.
    pub read_timeout: Duration,
    /// Longest sleep of the write loop when every queue is empty.
    pub write_idle_interval: Duration,
    /// How long `disconnect` waits for both loops.
    pub shutdown_timeout: Duration,
    /// Buffer of the inbound message broadcast.
    pub inbound_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_queued_per_channel: 1000,
            max_line_length: 500,
            flood_window: Duration::from_secs(30),
            flood_max_messages: 20,
            wait_for_motd: true,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(15),
            write_idle_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(15),
            inbound_capacity: 1000,
        }
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.clamp(MIN_READ_CHUNK_SIZE, MAX_READ_CHUNK_SIZE);
        self
    }

    pub fn with_max_queued_per_channel(mut self, max: usize) -> Self {
        self.max_queued_per_channel = max.max(1);
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    pub fn with_flood_control(mut self, window: Duration, max_messages: usize) -> Self {
        self.flood_window = window;
        self.flood_max_messages = max_messages;
        self
    }

    pub fn with_wait_for_motd(mut self, wait: bool) -> Self {
        self.wait_for_motd = wait;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_idle_interval(mut self, interval: Duration) -> Self {
        self.write_idle_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Socket is up and both loops are running.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Authenticating | ConnectionState::Connected)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Channel queues in a stable order; the system queue is always first.
///
/// Lookups are case-insensitive: servers may echo a channel in another case
/// than it was joined with.
#[derive(Default)]
struct ChannelTable {
    order: Vec<Arc<ChannelQueue>>,
    by_name: HashMap<String, usize>,
}

impl ChannelTable {
    fn insert(&mut self, queue: Arc<ChannelQueue>) {
        self.by_name.insert(irc_lower(queue.name()), self.order.len());
        self.order.push(queue);
    }

    fn get(&self, name: &str) -> Option<Arc<ChannelQueue>> {
        self.by_name
            .get(&irc_lower(name))
            .map(|&idx| self.order[idx].clone())
    }

    fn snapshot(&self) -> Vec<Arc<ChannelQueue>> {
        self.order.clone()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.by_name.clear();
    }
}

#[derive(Default)]
struct LoopHandles {
    read: Option<JoinHandle<()>>,
    write: Option<JoinHandle<()>>,
}

struct Shared {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    /// True once end of MOTD was seen (or immediately if not waiting for it).
    auth_gate: watch::Sender<bool>,
    channels: RwLock<ChannelTable>,
    router: Router,
    inbound: broadcast::Sender<Message>,
    write_wakeup: Notify,
    loops: Mutex<LoopHandles>,
    live_loops: AtomicUsize,
}

/// A connection to an IRC server.
///
/// Cheap to clone; all clones drive the same socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (auth_gate, _) = watch::channel(false);
        let (inbound, _) = broadcast::channel(config.inbound_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                state,
                auth_gate,
                channels: RwLock::new(ChannelTable::default()),
                router: Router::new(),
                inbound,
                write_wakeup: Notify::new(),
                loops: Mutex::new(LoopHandles::default()),
                live_loops: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Returns whether the socket is open and both loops are running.
    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Returns whether end of MOTD was seen on this connection.
    pub fn is_logged_in(&self) -> bool {
        *self.shared.auth_gate.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribes to every inbound message, in arrival order.
    ///
    /// Slow receivers lag and lose the oldest messages; handlers do not.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.shared.inbound.subscribe()
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    /// Registers a handler for inbound messages.
    pub fn add_handler(&self, handler: impl MessageHandler + 'static) {
        self.shared.router.register(Arc::new(handler));
    }

    /// Registers a closure for inbound messages.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Connection, Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add_handler(handler);
    }

    /// Returns the queue of a joined (or joining) channel, ignoring case.
    pub fn channel(&self, name: &str) -> Option<Arc<ChannelQueue>> {
        self.shared.channels.read().get(name)
    }

    /// Names of all queues, system queue first.
    pub fn channel_names(&self) -> Vec<String> {
        self.shared
            .channels
            .read()
            .order
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Connects to the configured server, starts both loops and queues login.
    ///
    /// Returns once the loops run. Login completes asynchronously; use
    /// [`Connection::wait_for_motd`] to wait for it.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.begin_connecting()?;

        let addr = self.shared.config.credentials.addr();
        tracing::info!("Connecting to IRC server {}...", addr);

        let stream = match tokio::time::timeout(
            self.shared.config.connect_timeout,
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!("Connection to {} failed: {}", addr, e);
                self.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected);
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                tracing::error!("Connection to {} timed out", addr);
                self.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected);
                return Err(ClientError::Timeout);
            }
        };

        stream.set_nodelay(true).ok();
        tracing::info!("Connection established.");

        self.start(stream)
    }

    /// Runs the connection over an already established stream.
    pub async fn connect_stream<S>(&self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin_connecting()?;
        self.start(stream)
    }

    fn start<S>(&self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = &self.shared.config;
        let (reader, writer) = tokio::io::split(stream);

        {
            let mut channels = self.shared.channels.write();
            channels.clear();
            channels.insert(Arc::new(ChannelQueue::system(config.max_queued_per_channel)));
        }
        self.shared.auth_gate.send_replace(!config.wait_for_motd);
        self.shared.live_loops.store(2, Ordering::SeqCst);

        let read = tokio::spawn(self.clone().read_loop(reader));
        let write = tokio::spawn(self.clone().write_loop(writer));
        *self.shared.loops.lock() = LoopHandles {
            read: Some(read),
            write: Some(write),
        };

        self.transition(&[ConnectionState::Connecting], ConnectionState::Authenticating);
        self.authenticate()?;
        self.transition(&[ConnectionState::Authenticating], ConnectionState::Connected);
        Ok(())
    }

    fn authenticate(&self) -> Result<(), ClientError> {
        let creds = &self.shared.config.credentials;
        if let Some(ref password) = creds.password {
            self.send_raw(&format!("{} {}", PASS, password))?;
        }
        self.send_raw(&format!("{} {}", NICK, creds.nickname))?;
        self.send_raw(&format!(
            "{} {nick} {nick} {nick} :{nick}",
            USER,
            nick = creds.nickname
        ))?;
        Ok(())
    }

    /// Waits until end of MOTD (376) was seen.
    pub async fn wait_for_motd(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut gate = self.shared.auth_gate.subscribe();
        let mut state = self.shared.state.subscribe();

        tokio::time::timeout(timeout, async {
            tokio::select! {
                opened = wait_gate_open(&mut gate) => {
                    if opened { Ok(()) } else { Err(ClientError::ConnectionClosed) }
                }
                _ = wait_closing(&mut state) => Err(ClientError::ConnectionClosed),
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Registers a channel queue and sends `JOIN` through the system queue.
    ///
    /// The new queue rejects writes until the server confirms the join.
    pub fn join(&self, channel: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let config = &self.shared.config;

        {
            let mut channels = self.shared.channels.write();
            if channel.eq_ignore_ascii_case(SYSTEM_CHANNEL) || channels.get(channel).is_some() {
                tracing::error!("Already in channel: {}", channel);
                return Err(ClientError::AlreadyJoined(channel.to_string()));
            }
            channels.insert(Arc::new(ChannelQueue::new(
                channel,
                config.max_queued_per_channel,
                config.flood_window,
                config.flood_max_messages,
            )));
        }

        self.send_raw(&format!("{} {}", JOIN, channel))?;
        Ok(())
    }

    /// Queues a `PRIVMSG` to a joined channel.
    ///
    /// `Ok(false)` means the message was dropped: not joined yet, flood
    /// control, or a full queue.
    pub fn send(&self, channel: &str, text: &str) -> Result<bool, ClientError> {
        self.ensure_open()?;
        let queue = self
            .channel(channel)
            .filter(|q| !q.is_system())
            .ok_or_else(|| ClientError::UnknownChannel(channel.to_string()))?;

        let message = self.privmsg(queue.name(), text);
        let accepted = queue.enqueue(message);
        if accepted {
            self.shared.write_wakeup.notify_one();
        }
        Ok(accepted)
    }

    /// Queues a protocol line on the system queue, bypassing join state,
    /// flood control and the MOTD gate. The line is never truncated.
    pub fn send_raw(&self, line: &str) -> Result<bool, ClientError> {
        self.ensure_open()?;
        let system = self
            .channel(SYSTEM_CHANNEL)
            .ok_or(ClientError::NotConnected)?;

        let accepted = system.enqueue(Message::parse(line));
        if accepted {
            self.shared.write_wakeup.notify_one();
        }
        Ok(accepted)
    }

    /// Signals both loops to stop without waiting for them.
    ///
    /// Safe to call from a handler.
    pub fn shutdown(&self) {
        self.begin_close();
    }

    /// Closes the socket and waits for both loops to exit.
    ///
    /// Idempotent. Fails with `ShutdownTimeout` if the loops outlive
    /// `shutdown_timeout`; they are aborted in that case.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        tracing::debug!("Disconnecting...");
        self.begin_close();

        let mut handles = std::mem::take(&mut *self.shared.loops.lock());
        let timeout = self.shared.config.shutdown_timeout;

        let joined = tokio::time::timeout(timeout, async {
            for (name, handle) in [("read", handles.read.as_mut()), ("write", handles.write.as_mut())] {
                if let Some(handle) = handle {
                    if let Err(e) = handle.await {
                        tracing::error!("Socket {} loop failed: {}", name, e);
                    }
                }
            }
        })
        .await;

        self.finish_close();

        match joined {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::error!("Socket loops did not stop within {:?}", timeout);
                for handle in [handles.read, handles.write].into_iter().flatten() {
                    handle.abort();
                }
                Err(ClientError::ShutdownTimeout(timeout))
            }
        }
    }

    // =========================================================================
    // Loops
    // =========================================================================

    async fn read_loop<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let config = &self.shared.config;
        tracing::debug!("Enter socket read loop. read_size: {}", config.read_chunk_size);

        let mut state = self.shared.state.subscribe();
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; config.read_chunk_size];

        loop {
            let read = tokio::select! {
                _ = wait_closing(&mut state) => break,
                read = tokio::time::timeout(config.read_timeout, reader.read(&mut buf)) => read,
            };

            let n = match read {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    tracing::warn!("Read: Socket is closed!");
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) if is_transient(&e) => {
                    tracing::debug!("Read blocked, retry...");
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::error!("Read error: {}", e);
                    break;
                }
            };

            tracing::trace!("Read {} bytes", n);
            decoder.extend(&buf[..n]);

            loop {
                match decoder.next_message() {
                    Ok(Some(message)) => self.shared.router.route(&self, message),
                    Ok(None) => break,
                    Err(e) => tracing::warn!("Skipping inbound line: {}", e),
                }
            }
        }

        self.begin_close();
        self.loop_exited();
        tracing::debug!("Exit socket read loop.");
    }

    async fn write_loop<W>(self, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        tracing::debug!("Enter socket write loop.");
        let mut state = self.shared.state.subscribe();
        let idle = self.shared.config.write_idle_interval;

        'pass: loop {
            let closing = state.borrow_and_update().is_closing();
            if closing {
                break;
            }

            let gate_open = *self.shared.auth_gate.borrow();
            let queues = self.shared.channels.read().snapshot();
            let mut wrote = false;

            for queue in queues {
                if !queue.is_system() && !gate_open {
                    continue;
                }
                let Some(message) = queue.dequeue_next() else {
                    continue;
                };

                tracing::debug!("Send message: {}", loggable(message.raw()));
                if let Err(e) = write_line(&mut writer, message.raw()).await {
                    tracing::error!("Send failed: {}", e);
                    break 'pass;
                }
                queue.record_sent();
                wrote = true;
            }

            if !wrote {
                tokio::select! {
                    _ = self.shared.write_wakeup.notified() => {}
                    _ = tokio::time::sleep(idle) => {}
                    _ = wait_closing(&mut state) => {}
                }
            }
        }

        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Socket shutdown: {}", e);
        }
        self.begin_close();
        self.loop_exited();
        tracing::debug!("Exit socket write loop");
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Opens the gate for channel queues (end of MOTD seen).
    pub(crate) fn open_auth_gate(&self) {
        if !self.shared.auth_gate.send_replace(true) {
            tracing::info!("End of MOTD, channel writes enabled");
            self.shared.write_wakeup.notify_one();
        }
    }

    /// Publishes an inbound message to subscribers.
    pub(crate) fn publish(&self, message: &Message) {
        // No subscribers is fine.
        let _ = self.shared.inbound.send(message.clone());
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Builds a `PRIVMSG`, cutting the text so the whole line fits in
    /// `max_line_length` characters. The command and channel are kept whole.
    fn privmsg(&self, channel: &str, text: &str) -> Message {
        let head = format!("{} {} :", PRIVMSG, channel);
        let budget = self
            .shared
            .config
            .max_line_length
            .saturating_sub(head.chars().count());

        let text = match text.char_indices().nth(budget) {
            Some((idx, _)) => {
                tracing::debug!(
                    "Truncating message to {} to {} chars",
                    channel,
                    self.shared.config.max_line_length
                );
                &text[..idx]
            }
            None => text,
        };
        Message::parse(&format!("{head}{text}"))
    }

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if from.contains(state) {
                tracing::debug!("Connection state: {} -> {}", state, to);
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn begin_connecting(&self) -> Result<(), ClientError> {
        if self.transition(
            &[ConnectionState::Disconnected, ConnectionState::Closed],
            ConnectionState::Connecting,
        ) {
            Ok(())
        } else {
            Err(ClientError::AlreadyConnected)
        }
    }

    fn begin_close(&self) {
        if self.transition(
            &[
                ConnectionState::Connecting,
                ConnectionState::Authenticating,
                ConnectionState::Connected,
            ],
            ConnectionState::Closing,
        ) {
            self.shared.write_wakeup.notify_one();
        }
    }

    fn finish_close(&self) {
        if self.transition(
            &[
                ConnectionState::Connecting,
                ConnectionState::Authenticating,
                ConnectionState::Connected,
                ConnectionState::Closing,
            ],
            ConnectionState::Closed,
        ) {
            self.shared.channels.write().clear();
            self.shared.auth_gate.send_replace(false);
            tracing::info!("Connection closed");
        }
    }

    fn loop_exited(&self) {
        if self.shared.live_loops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish_close();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.shared.config.credentials.addr())
            .field("state", &self.state())
            .field("logged_in", &self.is_logged_in())
            .field("channels", &self.channel_names())
            .finish()
    }
}

/// Writes one line plus `\r\n`, looping until every byte is out.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<usize, ClientError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_line(line);
    let mut sent = 0;

    while sent < encoded.len() {
        match writer.write(&encoded[sent..]).await {
            Ok(0) => {
                tracing::warn!("Write: Socket is closed!");
                return Err(ClientError::ConnectionClosed);
            }
            Ok(n) => sent += n,
            Err(e) if is_transient(&e) => {
                tracing::debug!("Send blocked, retry...");
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(ClientError::Io(e)),
        }
    }

    writer.flush().await?;
    Ok(sent)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Masks the password of a `PASS` line.
fn loggable(line: &str) -> &str {
    if line.starts_with("PASS ") {
        "PASS ***"
    } else {
        line
    }
}

async fn wait_closing(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(ConnectionState::is_closing).await;
}

async fn wait_gate_open(gate: &mut watch::Receiver<bool>) -> bool {
    gate.wait_for(|open| *open).await.is_ok()
}
