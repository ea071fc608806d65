//! The TCP server: listen socket, acceptor reactor, I/O reactor pool.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::addr::Address;
use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::connection::{
    CloseCallback, Connection, ConnectionCallback, MessageCallback, WriteCompleteCallback,
};
use crate::error::{NetError, NetResult};
use crate::pool::{BufferPool, PooledBuffer};
use crate::reactor::EventLoop;
use crate::socket::Socket;
use crate::timeout::TimeoutManager;
use crate::timestamp::Timestamp;

#[derive(Default)]
struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    close: Option<CloseCallback>,
}

/// Cross-thread handle that unblocks [`Server::serve_forever`].
///
/// Stopping the acceptor returns control to the thread running the server;
/// that thread (or any other non-reactor thread) then calls [`Server::stop`]
/// for full teardown.
#[derive(Clone)]
pub struct ShutdownHandle {
    acceptor: Arc<EventLoop>,
}

impl ShutdownHandle {
    /// Stops the acceptor reactor, returning control from `serve_forever`.
    pub fn shutdown(&self) {
        self.acceptor.stop();
    }
}

/// A multi-reactor TCP server.
///
/// [`Server::bind`] builds everything on the calling thread: the listening
/// socket, the acceptor reactor (owned by that thread), one reactor per I/O
/// worker thread, and the timeout sweeper thread.
/// [`Server::serve_forever`] then runs the acceptor on the constructing
/// thread until stopped.
///
/// Accepted connections are dealt to I/O reactors round-robin, starting at
/// reactor 0. Install callbacks before serving; they apply to connections
/// accepted afterwards.
pub struct Server {
    name: String,
    local_addr: Address,
    acceptor_loop: Arc<EventLoop>,
    io_loops: Vec<Arc<EventLoop>>,
    io_threads: Mutex<Vec<JoinHandle<()>>>,
    timeout_thread: Mutex<Option<JoinHandle<()>>>,
    timeout_manager: Arc<TimeoutManager>,
    connections: Arc<Mutex<HashMap<RawFd, Arc<Connection>>>>,
    running: Arc<AtomicBool>,
    callbacks: Arc<Mutex<UserCallbacks>>,
}

impl Server {
    /// Binds the listen socket and brings up the reactor pool.
    ///
    /// # Panics
    ///
    /// Panics if `config.io_threads` is zero.
    pub fn bind(config: ServerConfig) -> NetResult<Server> {
        assert!(config.io_threads > 0, "io_threads must be positive");

        let listen_socket = Arc::new(Socket::new_stream()?);
        listen_socket.set_reuse_addr(true)?;
        listen_socket
            .bind(config.bind_addr)
            .map_err(|source| NetError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        listen_socket.listen()?;
        let local_addr = listen_socket.local_addr()?;

        let connections: Arc<Mutex<HashMap<RawFd, Arc<Connection>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let timeout_manager = {
            let connections = Arc::clone(&connections);
            Arc::new(TimeoutManager::new(config.idle_timeout, move |fd| {
                let conn = connections
                    .lock()
                    .expect("connection map lock poisoned")
                    .get(&fd)
                    .cloned();
                if let Some(conn) = conn {
                    info!(name = %conn.name(), "closing idle connection");
                    conn.force_close();
                }
            }))
        };

        let mut io_loops: Vec<Arc<EventLoop>> = Vec::with_capacity(config.io_threads);
        let mut io_threads: Vec<JoinHandle<()>> = Vec::with_capacity(config.io_threads);
        for i in 0..config.io_threads {
            match EventLoop::spawn(&format!("io-{i}")) {
                Ok((event_loop, handle)) => {
                    io_loops.push(event_loop);
                    io_threads.push(handle);
                }
                Err(e) => {
                    // Unwind the workers that did come up.
                    for event_loop in &io_loops {
                        event_loop.stop();
                    }
                    for handle in io_threads {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let timeout_thread = {
            let running = Arc::clone(&running);
            let timeout_manager = Arc::clone(&timeout_manager);
            thread::Builder::new()
                .name("timeout-sweeper".to_string())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_secs(1));
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                        timeout_manager.sweep();
                    }
                })
        };
        let timeout_thread = match timeout_thread {
            Ok(handle) => handle,
            Err(e) => {
                for event_loop in &io_loops {
                    event_loop.stop();
                }
                for handle in io_threads {
                    let _ = handle.join();
                }
                return Err(NetError::Io(e));
            }
        };

        // The acceptor reactor belongs to the thread calling bind(), which
        // is the thread that will run serve_forever(). Its channel and the
        // listen socket live on inside the reactor's index once registered.
        let acceptor_loop = EventLoop::new()?;
        let acceptor_channel = Channel::new(Arc::downgrade(&acceptor_loop), listen_socket.fd());

        let callbacks: Arc<Mutex<UserCallbacks>> = Arc::new(Mutex::new(UserCallbacks::default()));
        {
            let listen_socket = Arc::clone(&listen_socket);
            let io_loops = io_loops.clone();
            let next_loop = AtomicUsize::new(0);
            let conn_seq = AtomicU64::new(0);
            let connections = Arc::clone(&connections);
            let timeout_manager = Arc::clone(&timeout_manager);
            let callbacks = Arc::clone(&callbacks);
            let pool = BufferPool::global().clone();
            let server_name = config.name.clone();
            let high_watermark = config.high_watermark;
            let fallback_local = local_addr;

            acceptor_channel.set_read_callback(move |_ts: Timestamp| {
                loop {
                    match listen_socket.accept() {
                        Ok((socket, peer)) => {
                            let index =
                                next_loop.fetch_add(1, Ordering::Relaxed) % io_loops.len();
                            let event_loop = Arc::clone(&io_loops[index]);
                            let id = conn_seq.fetch_add(1, Ordering::Relaxed);
                            let name = format!("{server_name}-{peer}#{id}");
                            let fd = socket.fd();
                            let local = socket.local_addr().unwrap_or(fallback_local);

                            let conn = Connection::new(
                                socket,
                                event_loop,
                                name,
                                local,
                                peer,
                                pool.clone(),
                            );
                            conn.set_high_watermark(high_watermark);
                            install_callbacks(&conn, &callbacks, &connections, &timeout_manager);

                            connections
                                .lock()
                                .expect("connection map lock poisoned")
                                .insert(fd, Arc::clone(&conn));
                            timeout_manager.add(fd);

                            info!(
                                name = %conn.name(),
                                peer = %peer,
                                reactor = index,
                                "accepted connection"
                            );
                            let established = Arc::clone(&conn);
                            conn.event_loop().post(move || established.establish());
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            });
        }
        // Edge-triggered: the callback above drains the whole accept burst.
        acceptor_channel.set_edge_triggered(true);
        acceptor_channel.enable_read();

        info!(
            name = %config.name,
            addr = %local_addr,
            io_threads = config.io_threads,
            "server bound"
        );
        Ok(Server {
            name: config.name,
            local_addr,
            acceptor_loop,
            io_loops,
            io_threads: Mutex::new(io_threads),
            timeout_thread: Mutex::new(Some(timeout_thread)),
            timeout_manager,
            connections,
            running,
            callbacks,
        })
    }

    /// The server's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address, with port 0 resolved.
    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    /// Number of I/O reactors.
    pub fn io_thread_count(&self) -> usize {
        self.io_loops.len()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection map lock poisoned")
            .len()
    }

    /// Installs the lifecycle callback, invoked on every up and down
    /// transition of every connection accepted afterwards.
    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .connection = Some(Arc::new(cb));
    }

    /// Installs the message callback, invoked with each pooled read buffer.
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

    /// Installs the close callback, invoked before a closing connection is
    /// forgotten.
    pub fn set_close_callback(&self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.lock().expect("callback lock poisoned").close = Some(Arc::new(cb));
    }

    /// True while the acceptor reactor is inside [`Server::serve_forever`].
    ///
    /// A stop request races a `serve_forever` that has not entered its loop
    /// yet (the loop resets the stop flag on entry); callers that stop a
    /// freshly started server should wait for this to turn true first.
    pub fn is_serving(&self) -> bool {
        self.acceptor_loop.is_running()
    }

    /// A clone-able handle that stops the acceptor from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            acceptor: Arc::clone(&self.acceptor_loop),
        }
    }

    /// Runs the acceptor reactor until stopped.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one that called
    /// [`Server::bind`]; the acceptor reactor is owned by that thread.
    pub fn serve_forever(&self) {
        info!(name = %self.name, addr = %self.local_addr, "serving");
        self.acceptor_loop.run();
    }

    /// Stops everything: destroys live connections, stops the acceptor and
    /// the I/O reactors, joins the worker and sweeper threads. Idempotent.
    ///
    /// Must not be called from a reactor thread (it joins them).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.name, "server stopping");

        let live: Vec<Arc<Connection>> = {
            let mut map = self
                .connections
                .lock()
                .expect("connection map lock poisoned");
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in live {
            self.timeout_manager.remove(conn.fd());
            let doomed = Arc::clone(&conn);
            conn.event_loop().post(move || doomed.destroy());
        }

        self.acceptor_loop.stop();
        for event_loop in &self.io_loops {
            event_loop.stop();
        }
        for handle in self
            .io_threads
            .lock()
            .expect("worker handle lock poisoned")
            .drain(..)
        {
            if handle.join().is_err() {
                warn!("an I/O worker panicked before join");
            }
        }
        if let Some(handle) = self
            .timeout_thread
            .lock()
            .expect("sweeper handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
        info!(name = %self.name, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn install_callbacks(
    conn: &Arc<Connection>,
    callbacks: &Arc<Mutex<UserCallbacks>>,
    connections: &Arc<Mutex<HashMap<RawFd, Arc<Connection>>>>,
    timeout_manager: &Arc<TimeoutManager>,
) {
    let user = callbacks.lock().expect("callback lock poisoned");

    if let Some(cb) = user.connection.clone() {
        conn.set_connection_callback(move |c| cb(c));
    }
    {
        // Every delivered read refreshes the idle timer.
        let user_message = user.message.clone();
        let timeout_manager = Arc::clone(timeout_manager);
        conn.set_message_callback(move |c, buffer, ts| {
            timeout_manager.update(c.fd());
            if let Some(cb) = &user_message {
                cb(c, buffer, ts);
            }
        });
    }
    if let Some(cb) = user.write_complete.clone() {
        conn.set_write_complete_callback(move |c| cb(c));
    }
    if let Some(cb) = user.close.clone() {
        conn.set_close_callback(move |c| cb(c));
    }
    {
        let connections = Arc::clone(connections);
        let timeout_manager = Arc::clone(timeout_manager);
        conn.set_close_notification(move |c| {
            timeout_manager.remove(c.fd());
            connections
                .lock()
                .expect("connection map lock poisoned")
                .remove(&c.fd());
            let doomed = Arc::clone(c);
            c.event_loop().post(move || doomed.destroy());
        });
    }
}
