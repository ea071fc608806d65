//! The event loop: one epoll set, one thread, one wake descriptor.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, ChannelState, EventSet};
use crate::error::{NetError, NetResult};
use crate::timestamp::Timestamp;

/// Ceiling on one epoll wait, which also bounds how long a stop request can
/// go unnoticed on an idle loop.
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// Initial size of the ready-events scratch; doubled whenever a poll fills it.
const EVENT_LIST_INITIAL: usize = 64;

/// A deferred task posted to a reactor.
pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_ON_THIS_THREAD: Cell<bool> = Cell::new(false);
}

/// A single-threaded reactor multiplexing many descriptors.
///
/// Each loop owns an epoll set and a counting eventfd used for cross-thread
/// wakeups. All channel registration and dispatch happens on the thread that
/// constructed the loop; every other thread interacts exclusively through
/// [`EventLoop::post`] and [`EventLoop::stop`], which wake the loop through
/// the eventfd.
pub struct EventLoop {
    epoll_fd: OwnedFd,
    wake_fd: OwnedFd,
    wake_channel: Arc<Channel>,
    thread_id: ThreadId,
    looping: AtomicBool,
    stop_requested: AtomicBool,
    draining_tasks: AtomicBool,
    last_poll_micros: AtomicI64,
    channels: Mutex<HashMap<RawFd, Arc<Channel>>>,
    pending_tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates a reactor owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already hosts a reactor: the thread identity is
    /// captured here and every registration is checked against it, so two
    /// loops on one thread can never be correct.
    pub fn new() -> NetResult<Arc<EventLoop>> {
        LOOP_ON_THIS_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "another event loop already lives on this thread"
            );
        });

        let epoll_raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_raw < 0 {
            return Err(NetError::Io(io::Error::last_os_error()));
        }
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(epoll_raw) };

        let wake_raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_raw < 0 {
            return Err(NetError::Io(io::Error::last_os_error()));
        }
        let wake_fd = unsafe { OwnedFd::from_raw_fd(wake_raw) };

        let event_loop = Arc::new_cyclic(|this| EventLoop {
            wake_channel: Channel::new(this.clone(), wake_raw),
            epoll_fd,
            wake_fd,
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            draining_tasks: AtomicBool::new(false),
            last_poll_micros: AtomicI64::new(0),
            channels: Mutex::new(HashMap::new()),
            pending_tasks: Mutex::new(Vec::new()),
        });
        LOOP_ON_THIS_THREAD.with(|flag| flag.set(true));

        event_loop
            .wake_channel
            .set_read_callback(move |_ts| drain_wake(wake_raw));
        event_loop.wake_channel.enable_read();

        debug!(
            epoll_fd = event_loop.epoll_fd.as_raw_fd(),
            wake_fd = wake_raw,
            "event loop created"
        );
        Ok(event_loop)
    }

    /// Spawns a named worker thread that constructs its own reactor and runs
    /// it until stopped. Returns the reactor handle once the worker is up.
    pub(crate) fn spawn(name: &str) -> NetResult<(Arc<EventLoop>, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match EventLoop::new() {
                Ok(event_loop) => {
                    let _ = tx.send(Ok(Arc::clone(&event_loop)));
                    event_loop.run();
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            })?;
        let event_loop = rx.recv().map_err(|_| NetError::WorkerStart {
            name: name.to_string(),
        })??;
        Ok((event_loop, handle))
    }

    /// True on the thread that constructed this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// The timestamp recorded right after the most recent poll wake.
    pub fn last_poll_time(&self) -> Timestamp {
        Timestamp::from_micros(self.last_poll_micros.load(Ordering::Acquire))
    }

    /// True while `run()` is executing.
    pub fn is_running(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Reconciles a channel's interest with the epoll set.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop's thread; interest mutation is
    /// single-threaded by contract.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(
            self.is_in_loop_thread(),
            "update_channel called off the loop thread"
        );
        match channel.state() {
            ChannelState::New => {
                self.channels
                    .lock()
                    .expect("channel index lock poisoned")
                    .insert(channel.fd(), Arc::clone(channel));
                self.epoll_ctl(libc::EPOLL_CTL_ADD, channel);
                channel.set_state(ChannelState::Registered);
                trace!(fd = channel.fd(), "channel registered");
            }
            ChannelState::Registered => {
                if channel.interest().is_empty() {
                    self.epoll_ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(ChannelState::Removed);
                    trace!(fd = channel.fd(), "channel auto-detached");
                } else {
                    self.epoll_ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
            ChannelState::Removed => {
                let still_indexed = self
                    .channels
                    .lock()
                    .expect("channel index lock poisoned")
                    .get(&channel.fd())
                    .is_some_and(|c| Arc::ptr_eq(c, channel));
                if still_indexed {
                    self.epoll_ctl(libc::EPOLL_CTL_ADD, channel);
                    channel.set_state(ChannelState::Registered);
                    trace!(fd = channel.fd(), "channel re-registered");
                } else {
                    error!(fd = channel.fd(), "update on a channel no longer indexed");
                }
            }
        }
    }

    /// Drops a channel from the index and the epoll set.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop's thread.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        assert!(
            self.is_in_loop_thread(),
            "remove_channel called off the loop thread"
        );
        self.channels
            .lock()
            .expect("channel index lock poisoned")
            .remove(&channel.fd());
        if channel.state() == ChannelState::Registered {
            self.epoll_ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_state(ChannelState::Removed);
        trace!(fd = channel.fd(), "channel removed");
    }

    /// True if this exact channel is indexed by the loop.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .lock()
            .expect("channel index lock poisoned")
            .get(&channel.fd())
            .is_some_and(|c| Arc::ptr_eq(c, channel))
    }

    /// Runs the loop until [`EventLoop::stop`] is observed.
    ///
    /// # Panics
    ///
    /// Panics when called off the thread that constructed the loop.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "run() must execute on the loop's own thread"
        );
        self.looping.store(true, Ordering::Release);
        self.stop_requested.store(false, Ordering::Release);
        debug!("event loop running");

        let mut event_list: Vec<libc::epoll_event> =
            vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_LIST_INITIAL];
        let mut active_channels: Vec<Arc<Channel>> = Vec::new();

        while !self.stop_requested.load(Ordering::Acquire) {
            active_channels.clear();

            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd.as_raw_fd(),
                    event_list.as_mut_ptr(),
                    event_list.len() as libc::c_int,
                    POLL_TIMEOUT_MS,
                )
            };
            let ts = Timestamp::now();
            self.last_poll_micros.store(ts.micros(), Ordering::Release);

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "epoll_wait failed");
                continue;
            }
            let n = n as usize;
            if n == event_list.len() {
                // The scratch was exactly filled; more may be pending.
                event_list.resize(
                    event_list.len() * 2,
                    libc::epoll_event { events: 0, u64: 0 },
                );
            }

            {
                let channels = self.channels.lock().expect("channel index lock poisoned");
                for event in &event_list[..n] {
                    let fd = event.u64 as RawFd;
                    let ready = EventSet::from_bits(event.events);
                    if let Some(channel) = channels.get(&fd) {
                        channel.set_ready(ready);
                        active_channels.push(Arc::clone(channel));
                    } else {
                        trace!(fd, "readiness for an unindexed descriptor ignored");
                    }
                }
            }

            for channel in &active_channels {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| channel.handle_event(ts)));
                if outcome.is_err() {
                    error!(fd = channel.fd(), "callback panicked; loop continues");
                }
            }

            self.drain_pending_tasks();
        }

        self.looping.store(false, Ordering::Release);
        debug!("event loop stopped");
    }

    /// Requests the loop to stop; wakes it when called from another thread.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Wakes the loop by writing one count to its eventfd.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            warn!(
                error = %io::Error::last_os_error(),
                "short write to the wake descriptor"
            );
        }
    }

    /// Enqueues a task for the loop thread and wakes it if needed.
    ///
    /// Tasks posted from one thread run in posting order. A task posted from
    /// the loop thread outside the drain phase runs at the end of the
    /// current iteration without a wakeup.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        {
            self.pending_tasks
                .lock()
                .expect("pending task lock poisoned")
                .push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.draining_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn drain_pending_tasks(&self) {
        self.draining_tasks.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self
                .pending_tasks
                .lock()
                .expect("pending task lock poisoned");
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("posted task panicked; loop continues");
            }
        }
        self.draining_tasks.store(false, Ordering::Release);
    }

    fn epoll_ctl(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let mut event = libc::epoll_event {
            events: channel.registration_bits(),
            u64: channel.fd() as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, channel.fd(), &mut event)
        };
        if rc < 0 {
            error!(
                fd = channel.fd(),
                op,
                error = %io::Error::last_os_error(),
                "epoll_ctl failed"
            );
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // The loop may be dropped off its thread after a join; tear the wake
        // channel down directly instead of going through update_channel.
        self.channels
            .lock()
            .expect("channel index lock poisoned")
            .remove(&self.wake_channel.fd());
        if self.wake_channel.state() == ChannelState::Registered {
            let mut event = libc::epoll_event {
                events: 0,
                u64: self.wake_channel.fd() as u64,
            };
            unsafe {
                libc::epoll_ctl(
                    self.epoll_fd.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    self.wake_channel.fd(),
                    &mut event,
                )
            };
        }
        self.wake_channel.set_state(ChannelState::Removed);
        if self.is_in_loop_thread() {
            LOOP_ON_THIS_THREAD.with(|flag| flag.set(false));
        }
    }
}

/// Consumes one wake from the eventfd and validates the protocol: exactly 8
/// bytes carrying exactly the count 1.
fn drain_wake(fd: RawFd) {
    let mut count: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize || count != 1 {
        warn!(fd, bytes = n, count, "wake descriptor protocol violation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn captures_the_constructing_thread() {
        let event_loop = EventLoop::new().unwrap();
        assert!(event_loop.is_in_loop_thread());
        let el = Arc::clone(&event_loop);
        thread::spawn(move || {
            assert!(!el.is_in_loop_thread());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "another event loop already lives on this thread")]
    fn second_loop_on_one_thread_panics() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new();
    }

    #[test]
    fn dropping_a_loop_frees_its_thread_slot() {
        let first = EventLoop::new().unwrap();
        drop(first);
        let _second = EventLoop::new().unwrap();
    }

    #[test]
    fn wake_channel_is_indexed() {
        let event_loop = EventLoop::new().unwrap();
        assert!(event_loop.has_channel(&event_loop.wake_channel));
        assert_eq!(
            event_loop.wake_channel.state(),
            ChannelState::Registered
        );
    }

    #[test]
    fn posted_tasks_run_in_order_on_the_loop_thread() {
        let (event_loop, handle) = EventLoop::spawn("test-loop").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let on_loop = Arc::new(AtomicBool::new(false));

        for i in 0..3 {
            let order = Arc::clone(&order);
            let el = Arc::clone(&event_loop);
            let on_loop = Arc::clone(&on_loop);
            event_loop.post(move || {
                if el.is_in_loop_thread() {
                    on_loop.store(true, Ordering::SeqCst);
                }
                order.lock().unwrap().push(i);
            });
        }

        // The posts wake the loop; wait for the drain.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while order.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(on_loop.load(Ordering::SeqCst), "tasks ran on the loop thread");

        event_loop.stop();
        handle.join().unwrap();
        assert!(!event_loop.is_running());
    }

    #[test]
    fn stop_from_another_thread_interrupts_an_idle_loop() {
        let (event_loop, handle) = EventLoop::spawn("stoppable").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !event_loop.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(event_loop.is_running());

        let start = std::time::Instant::now();
        event_loop.stop();
        handle.join().unwrap();
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "the wakeup should beat the 100ms poll ceiling comfortably"
        );
    }

    #[test]
    fn last_poll_time_advances_while_running() {
        let (event_loop, handle) = EventLoop::spawn("poller").unwrap();
        thread::sleep(Duration::from_millis(250));
        assert!(event_loop.last_poll_time().is_valid());

        let first = event_loop.last_poll_time();
        thread::sleep(Duration::from_millis(250));
        assert!(event_loop.last_poll_time() >= first);

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn panicking_task_does_not_kill_the_loop() {
        let (event_loop, handle) = EventLoop::spawn("panicky").unwrap();
        let ran_after = Arc::new(AtomicUsize::new(0));

        event_loop.post(|| panic!("task exploded"));
        {
            let ran_after = Arc::clone(&ran_after);
            event_loop.post(move || {
                ran_after.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ran_after.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);

        event_loop.stop();
        handle.join().unwrap();
    }
}
