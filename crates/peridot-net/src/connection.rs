//! The per-peer connection state machine.

use std::any::Any;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, trace, warn};

use crate::addr::Address;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::pool::{BufferPool, PooledBuffer};
use crate::reactor::EventLoop;
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Default output-buffer size at which back-pressure is signaled.
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024 * 1024;

/// Read scratch request size; the pool serves it from its 8 KiB class.
const READ_SCRATCH_SIZE: usize = 4096;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but not yet registered with its reactor.
    Connecting,
    /// Registered and exchanging data.
    Connected,
    /// Half-close requested; flushing the output buffer first.
    Disconnecting,
    /// Torn down.
    Disconnected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnecting => 2,
            ConnectionState::Disconnected => 3,
        }
    }
}

/// Fires on both lifecycle transitions: once connected, once disconnected.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Fires with freshly read bytes; the pooled buffer is handed over.
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, PooledBuffer, Timestamp) + Send + Sync>;
/// Fires when a send has fully reached the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Fires when the output buffer crosses the high watermark, with its size.
pub type HighWatermarkCallback = Arc<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
/// Fires on the close path, before the connection is forgotten.
pub type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_watermark: Option<HighWatermarkCallback>,
    close: Option<CloseCallback>,
    /// Installed by the server: forgets the connection and schedules
    /// `destroy()` after the user's close callback has run.
    close_notification: Option<CloseCallback>,
}

/// One live TCP peer: a socket, its channel, buffers and callbacks.
///
/// A connection is confined to the reactor it was handed to at accept time:
/// every handler, state transition and buffer mutation runs on that thread.
/// The `Arc<Connection>` handle itself travels freely; `send`, `shutdown`
/// and `force_close` called elsewhere post themselves to the owning reactor.
pub struct Connection {
    /// Self-reference for handing `Arc<Connection>` to callbacks and posted
    /// tasks; alive for as long as any strong handle is.
    this: Weak<Connection>,
    name: String,
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: Address,
    peer_addr: Address,
    state: AtomicU8,
    /// Guards against a second trip through the close path when a peer
    /// close races a forced close onto the same loop iteration.
    closing: AtomicBool,
    output: Mutex<Buffer>,
    high_watermark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    pool: BufferPool,
}

impl Connection {
    /// Wraps an accepted socket. The connection starts `Connecting`; the
    /// acceptor posts [`Connection::establish`] to `event_loop` to bring it
    /// up.
    pub(crate) fn new(
        socket: Socket,
        event_loop: Arc<EventLoop>,
        name: String,
        local_addr: Address,
        peer_addr: Address,
        pool: BufferPool,
    ) -> Arc<Connection> {
        if let Err(e) = socket.set_keepalive(true) {
            warn!(name = %name, error = %e, "failed to set keep-alive");
        }
        let fd = socket.fd();
        let channel = Channel::new(Arc::downgrade(&event_loop), fd);

        let conn = Arc::new_cyclic(|this: &Weak<Connection>| Connection {
            this: this.clone(),
            name,
            event_loop,
            socket,
            channel,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            closing: AtomicBool::new(false),
            output: Mutex::new(Buffer::new()),
            high_watermark: AtomicUsize::new(DEFAULT_HIGH_WATERMARK),
            callbacks: Mutex::new(Callbacks::default()),
            context: Mutex::new(None),
            pool,
        });

        {
            let weak = conn.this.clone();
            conn.channel.set_read_callback(move |ts| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(ts);
                }
            });
        }
        {
            let weak = conn.this.clone();
            conn.channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
        }
        {
            let weak = conn.this.clone();
            conn.channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
        {
            let weak = conn.this.clone();
            conn.channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });
        }

        info!(name = %conn.name, peer = %conn.peer_addr, fd, "connection created");
        conn
    }

    fn strong(&self) -> Arc<Connection> {
        self.this
            .upgrade()
            .expect("connection self-reference outlives every method call")
    }

    /// The connection's name, unique within its server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The reactor this connection lives on.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The underlying descriptor number.
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// The server-side endpoint.
    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    /// The peer endpoint.
    pub fn peer_addr(&self) -> Address {
        self.peer_addr
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// True while the connection is up.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Disables Nagle's algorithm for this peer.
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.socket.set_nodelay(on)
    }

    /// Output-buffer size at which the high-watermark callback fires.
    pub fn set_high_watermark(&self, bytes: usize) {
        self.high_watermark.store(bytes, Ordering::Relaxed);
    }

    /// Bytes currently queued in the output buffer.
    pub fn queued_bytes(&self) -> usize {
        self.output
            .lock()
            .expect("output buffer lock poisoned")
            .readable_bytes()
    }

    /// Attaches an arbitrary application payload to this connection.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock().expect("context lock poisoned") = Some(Box::new(value));
    }

    /// Runs `f` against the attached payload, if one of type `T` is present.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.context.lock().expect("context lock poisoned");
        guard.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// Installs the lifecycle callback (fires on up and down transitions).
    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .connection = Some(Arc::new(cb));
    }

    /// Installs the message callback.
    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<Connection>, PooledBuffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .message = Some(Arc::new(cb));
    }

    /// Installs the write-complete callback.
    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .write_complete = Some(Arc::new(cb));
    }

    /// Installs the high-watermark callback.
    pub fn set_high_watermark_callback(
        &self,
        cb: impl Fn(&Arc<Connection>, usize) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .high_watermark = Some(Arc::new(cb));
    }

    /// Installs the close callback.
    pub fn set_close_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.lock().expect("callback lock poisoned").close = Some(Arc::new(cb));
    }

    pub(crate) fn set_close_notification(
        &self,
        cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .close_notification = Some(Arc::new(cb));
    }

    /// Brings the connection up: ties the channel, enables read interest,
    /// transitions to `Connected` and fires the lifecycle callback.
    ///
    /// # Panics
    ///
    /// Panics when run off the owning reactor's thread; the acceptor posts
    /// this.
    pub(crate) fn establish(&self) {
        assert!(
            self.event_loop.is_in_loop_thread(),
            "establish must run on the owning loop thread"
        );
        let this = self.strong();
        self.channel.tie(&this);
        self.channel.enable_read();
        self.set_state(ConnectionState::Connected);
        debug!(name = %self.name, "connection established");

        let cb = self
            .callbacks
            .lock()
            .expect("callback lock poisoned")
            .connection
            .clone();
        if let Some(cb) = cb {
            cb(&this);
        }
    }

    /// Tears the connection down: fires the symmetric lifecycle callback if
    /// the peer was up, then unregisters the channel.
    ///
    /// # Panics
    ///
    /// Panics when run off the owning reactor's thread.
    pub(crate) fn destroy(&self) {
        assert!(
            self.event_loop.is_in_loop_thread(),
            "destroy must run on the owning loop thread"
        );
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            let cb = self
                .callbacks
                .lock()
                .expect("callback lock poisoned")
                .connection
                .clone();
            if let Some(cb) = cb {
                cb(&self.strong());
            }
        }
        self.channel.remove();
        info!(name = %self.name, "connection destroyed");
    }

    /// Queues `data` toward the peer.
    ///
    /// Dropped unless `Connected`. From the owning reactor thread this tries
    /// a direct write first; from anywhere else the bytes travel via the
    /// reactor's task queue, which serializes them with in-loop writes.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            trace!(name = %self.name, "send on a non-connected connection dropped");
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.strong();
            let owned = data.to_vec();
            self.event_loop.post(move || this.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            // Closed between the off-thread send and this task running.
            trace!(name = %self.name, "posted send arrived after disconnect");
            return;
        }

        let mut written = 0usize;
        let mut fault = false;
        let mut fire_write_complete = false;
        let mut watermark_crossing = None;
        {
            let mut output = self.output.lock().expect("output buffer lock poisoned");
            if output.readable_bytes() == 0 && !self.channel.is_writing() {
                match self.socket.write(data) {
                    Ok(n) => {
                        written = n;
                        if written == data.len() {
                            fire_write_complete = true;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        error!(name = %self.name, error = %e, "direct write failed");
                        fault = true;
                    }
                }
            }
            if !fault && written < data.len() {
                let queued = output.readable_bytes();
                let total = queued + (data.len() - written);
                let watermark = self.high_watermark.load(Ordering::Relaxed);
                if queued < watermark && total >= watermark {
                    watermark_crossing = Some(total);
                }
                output.append(&data[written..]);
                if !self.channel.is_writing() {
                    self.channel.enable_write();
                }
            }
        }

        if fault {
            self.handle_close();
            return;
        }
        if let Some(size) = watermark_crossing {
            let cb = self
                .callbacks
                .lock()
                .expect("callback lock poisoned")
                .high_watermark
                .clone();
            if let Some(cb) = cb {
                cb(&self.strong(), size);
            }
        }
        if fire_write_complete {
            let cb = self
                .callbacks
                .lock()
                .expect("callback lock poisoned")
                .write_complete
                .clone();
            if let Some(cb) = cb {
                cb(&self.strong());
            }
        }
    }

    /// Half-closes the write direction once the output buffer drains.
    pub fn shutdown(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        let this = self.strong();
        self.event_loop.post(move || this.shutdown_in_loop());
    }

    fn shutdown_in_loop(&self) {
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!(name = %self.name, error = %e, "shutdown(SHUT_WR) failed");
            }
        }
        // Otherwise the write handler completes the half-close on drain.
    }

    /// Drives the connection through the regular close path on its reactor.
    /// Used by the idle-timeout sweeper and other out-of-band closers.
    pub fn force_close(&self) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            let this = self.strong();
            self.event_loop.post(move || {
                let state = this.state();
                if state == ConnectionState::Connected || state == ConnectionState::Disconnecting
                {
                    this.handle_close();
                }
            });
        }
    }

    fn handle_read(&self, ts: Timestamp) {
        let mut scratch = self.pool.acquire(READ_SCRATCH_SIZE);
        match scratch.read_from_fd(self.socket.fd()) {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "read");
                let cb = self
                    .callbacks
                    .lock()
                    .expect("callback lock poisoned")
                    .message
                    .clone();
                if let Some(cb) = cb {
                    cb(&self.strong(), scratch, ts);
                }
                // Without a message callback the scratch drops straight back
                // to the pool, and the bytes with it.
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(name = %self.name, error = %e, "read failed");
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.is_writing() {
            trace!(name = %self.name, "write readiness with write interest off");
            return;
        }
        let mut drained = false;
        let mut fault = None;
        {
            let mut output = self.output.lock().expect("output buffer lock poisoned");
            match output.write_to_fd(self.socket.fd()) {
                Ok(_) => {
                    if output.readable_bytes() == 0 {
                        drained = true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => fault = Some(e),
            }
        }

        if let Some(e) = fault {
            error!(name = %self.name, error = %e, "flush failed");
            self.handle_error();
            self.handle_close();
            return;
        }
        if drained {
            self.channel.disable_write();
            match self.state() {
                ConnectionState::Disconnecting => {
                    if let Err(e) = self.socket.shutdown_write() {
                        error!(name = %self.name, error = %e, "deferred half-close failed");
                    }
                }
                ConnectionState::Connected => {
                    let cb = self
                        .callbacks
                        .lock()
                        .expect("callback lock poisoned")
                        .write_complete
                        .clone();
                    if let Some(cb) = cb {
                        cb(&self.strong());
                    }
                }
                _ => {}
            }
        }
    }

    fn handle_close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(name = %self.name, state = ?self.state(), "connection closing");
        self.channel.disable_all();

        let (close, notification) = {
            let cbs = self.callbacks.lock().expect("callback lock poisoned");
            (cbs.close.clone(), cbs.close_notification.clone())
        };
        // Pin the connection across both callbacks; the notification usually
        // drops the server's strong reference.
        let guard = self.strong();
        if let Some(cb) = close {
            cb(&guard);
        }
        if let Some(cb) = notification {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!(name = %self.name, error = %e, "socket error"),
            Ok(None) => error!(name = %self.name, "error event with no pending socket error"),
            Err(e) => error!(name = %self.name, error = %e, "SO_ERROR lookup failed"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(name = %self.name, fd = self.socket.fd(), "connection dropped");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
