//! Per-descriptor event registration and dispatch.

use std::any::Any;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::reactor::EventLoop;
use crate::timestamp::Timestamp;

/// A set of readiness or interest flags, bit-compatible with epoll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    /// The empty set.
    pub const NONE: EventSet = EventSet(0);
    /// Data to read (`EPOLLIN`).
    pub const READABLE: EventSet = EventSet(libc::EPOLLIN as u32);
    /// Priority data to read (`EPOLLPRI`).
    pub const PRIORITY: EventSet = EventSet(libc::EPOLLPRI as u32);
    /// Room to write (`EPOLLOUT`).
    pub const WRITABLE: EventSet = EventSet(libc::EPOLLOUT as u32);
    /// Peer hung up (`EPOLLHUP`).
    pub const HANGUP: EventSet = EventSet(libc::EPOLLHUP as u32);
    /// Peer half-closed its write direction (`EPOLLRDHUP`).
    pub const READ_HANGUP: EventSet = EventSet(libc::EPOLLRDHUP as u32);
    /// Error condition (`EPOLLERR`).
    pub const ERROR: EventSet = EventSet(libc::EPOLLERR as u32);

    /// Builds a set from raw epoll bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw epoll bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any flag of `other` is set in `self`.
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// The set with `other`'s flags removed.
    pub const fn without(self, other: EventSet) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

/// Where a channel stands with its reactor's epoll set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never registered.
    New,
    /// Present in the epoll set.
    Registered,
    /// Deleted from the epoll set (may be re-added).
    Removed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::New,
            1 => ChannelState::Registered,
            _ => ChannelState::Removed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ChannelState::New => 0,
            ChannelState::Registered => 1,
            ChannelState::Removed => 2,
        }
    }
}

/// Callback invoked on read readiness, with the poll-wake timestamp.
pub type ReadCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;
/// Callback invoked on write/close/error readiness.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// The per-descriptor record a reactor dispatches events to.
///
/// A channel does not own its descriptor; the owner (a connection, the
/// listen socket, the reactor's wake eventfd) does, and keeps the channel
/// alive alongside it. Interest mutations reconcile with the reactor's epoll
/// set immediately, and must therefore happen on the reactor's thread.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    this: Weak<Channel>,
    fd: RawFd,
    edge_triggered: AtomicBool,
    interest: AtomicU32,
    ready: AtomicU32,
    state: AtomicU8,
    callbacks: Mutex<Callbacks>,
    /// Weak link to the owning object, upgraded for the duration of one
    /// dispatch so callbacks never run against a freed owner. Events for a
    /// dead owner are dropped: its descriptor number may already belong to
    /// someone else.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    /// Creates an unregistered channel for `fd` on the given reactor.
    pub fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|this| Channel {
            event_loop,
            this: this.clone(),
            fd,
            edge_triggered: AtomicBool::new(false),
            interest: AtomicU32::new(0),
            ready: AtomicU32::new(0),
            state: AtomicU8::new(ChannelState::New.as_u8()),
            callbacks: Mutex::new(Callbacks::default()),
            tie: Mutex::new(None),
        })
    }

    /// The descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The current interest set.
    pub fn interest(&self) -> EventSet {
        EventSet::from_bits(self.interest.load(Ordering::Relaxed))
    }

    /// The readiness set stamped by the reactor before dispatch.
    pub fn ready(&self) -> EventSet {
        EventSet::from_bits(self.ready.load(Ordering::Relaxed))
    }

    pub(crate) fn set_ready(&self, ready: EventSet) {
        self.ready.store(ready.bits(), Ordering::Relaxed);
    }

    /// The registration state.
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    /// Requests edge-triggered registration (used by the accept path, which
    /// drains bursts itself).
    pub fn set_edge_triggered(&self, on: bool) {
        self.edge_triggered.store(on, Ordering::Relaxed);
    }

    /// The bits handed to `epoll_ctl`: interest plus the edge flag if set.
    pub(crate) fn registration_bits(&self) -> u32 {
        let mut bits = self.interest.load(Ordering::Relaxed);
        if self.edge_triggered.load(Ordering::Relaxed) {
            bits |= libc::EPOLLET as u32;
        }
        bits
    }

    /// True if write interest is currently set.
    pub fn is_writing(&self) -> bool {
        self.interest().intersects(EventSet::WRITABLE)
    }

    /// True if read interest is currently set.
    pub fn is_reading(&self) -> bool {
        self.interest().intersects(EventSet::READABLE)
    }

    /// Installs the read-readiness callback.
    pub fn set_read_callback(&self, cb: impl Fn(Timestamp) + Send + Sync + 'static) {
        self.callbacks.lock().expect("channel lock poisoned").read = Some(Arc::new(cb));
    }

    /// Installs the write-readiness callback.
    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().expect("channel lock poisoned").write = Some(Arc::new(cb));
    }

    /// Installs the close callback.
    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().expect("channel lock poisoned").close = Some(Arc::new(cb));
    }

    /// Installs the error callback.
    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().expect("channel lock poisoned").error = Some(Arc::new(cb));
    }

    /// Ties this channel to its owning object.
    ///
    /// Each dispatch upgrades the link and holds the strong reference until
    /// the dispatch finishes; a failed upgrade drops the event.
    pub fn tie<T>(&self, owner: &Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&owner);
        *self.tie.lock().expect("channel lock poisoned") = Some(weak);
    }

    /// Adds read (and priority-read) interest and reconciles with epoll.
    pub fn enable_read(&self) {
        self.add_interest(EventSet::READABLE | EventSet::PRIORITY);
    }

    /// Removes read interest.
    pub fn disable_read(&self) {
        self.remove_interest(EventSet::READABLE | EventSet::PRIORITY);
    }

    /// Adds write interest.
    pub fn enable_write(&self) {
        self.add_interest(EventSet::WRITABLE);
    }

    /// Removes write interest.
    pub fn disable_write(&self) {
        self.remove_interest(EventSet::WRITABLE);
    }

    /// Clears all interest; the reactor auto-detaches the descriptor.
    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Relaxed);
        self.update();
    }

    /// Detaches this channel from its reactor's index and epoll set.
    pub fn remove(&self) {
        if let (Some(event_loop), Some(this)) = (self.event_loop.upgrade(), self.this.upgrade()) {
            event_loop.remove_channel(&this);
        }
    }

    fn add_interest(&self, events: EventSet) {
        self.interest.fetch_or(events.bits(), Ordering::Relaxed);
        self.update();
    }

    fn remove_interest(&self, events: EventSet) {
        self.interest.fetch_and(!events.bits(), Ordering::Relaxed);
        self.update();
    }

    /// Asks the owning reactor to reconcile interest with its epoll set.
    /// Must run on the reactor's thread.
    fn update(&self) {
        if let (Some(event_loop), Some(this)) = (self.event_loop.upgrade(), self.this.upgrade()) {
            event_loop.update_channel(&this);
        }
    }

    /// Dispatches the stamped readiness to the installed callbacks.
    ///
    /// If tied, the owner is pinned for the duration; events for an owner
    /// that is already gone are dropped silently.
    pub fn handle_event(&self, ts: Timestamp) {
        let tied = self.tie.lock().expect("channel lock poisoned").clone();
        match tied {
            Some(weak) => match weak.upgrade() {
                Some(_owner_guard) => self.dispatch(ts),
                None => trace!(fd = self.fd, "dropping event for a gone owner"),
            },
            None => self.dispatch(ts),
        }
    }

    fn dispatch(&self, ts: Timestamp) {
        let ready = self.ready();
        let (read, write, close, error) = {
            let cbs = self.callbacks.lock().expect("channel lock poisoned");
            (
                cbs.read.clone(),
                cbs.write.clone(),
                cbs.close.clone(),
                cbs.error.clone(),
            )
        };

        // Hang-up with nothing left to read: the peer is gone for good.
        if ready.intersects(EventSet::HANGUP) && !ready.intersects(EventSet::READABLE) {
            if let Some(cb) = &close {
                cb();
            }
        }
        if ready.intersects(EventSet::ERROR) {
            if let Some(cb) = &error {
                cb();
            }
        }
        // EPOLLRDHUP still delivers the pending EOF through the read path.
        if ready.intersects(EventSet::READABLE | EventSet::PRIORITY | EventSet::READ_HANGUP) {
            if let Some(cb) = &read {
                cb(ts);
            }
        }
        if ready.intersects(EventSet::WRITABLE) {
            if let Some(cb) = &write {
                cb();
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn event_set_algebra() {
        let rw = EventSet::READABLE | EventSet::WRITABLE;
        assert!(rw.intersects(EventSet::READABLE));
        assert!(rw.intersects(EventSet::WRITABLE));
        assert!(!rw.intersects(EventSet::ERROR));
        assert!(rw.without(EventSet::READABLE | EventSet::WRITABLE).is_empty());
        assert_eq!(EventSet::NONE.bits(), 0);
        assert_eq!(
            EventSet::from_bits(rw.bits()),
            rw,
            "bits round-trip through epoll"
        );
    }

    #[test]
    fn new_channel_starts_empty() {
        // A dead loop reference keeps reconciliation a no-op, which is all a
        // unit test needs to watch the local state machine.
        let ch = Channel::new(Weak::new(), 42);
        assert_eq!(ch.fd(), 42);
        assert_eq!(ch.state(), ChannelState::New);
        assert!(ch.interest().is_empty());
        assert!(!ch.is_reading());
        assert!(!ch.is_writing());
    }

    #[test]
    fn interest_mutations_update_the_bitmask() {
        let ch = Channel::new(Weak::new(), 7);
        ch.enable_read();
        assert!(ch.is_reading());
        assert!(ch.interest().intersects(EventSet::PRIORITY));
        ch.enable_write();
        assert!(ch.is_writing());
        ch.disable_read();
        assert!(!ch.is_reading());
        assert!(ch.is_writing());
        ch.disable_all();
        assert!(ch.interest().is_empty());
    }

    #[test]
    fn edge_flag_only_affects_registration_bits() {
        let ch = Channel::new(Weak::new(), 7);
        ch.enable_read();
        let level = ch.registration_bits();
        ch.set_edge_triggered(true);
        let edge = ch.registration_bits();
        assert_eq!(edge & !level, libc::EPOLLET as u32);
        assert_eq!(ch.interest().bits(), level, "interest itself is unchanged");
    }

    #[test]
    fn dispatch_order_close_error_read_write() {
        let ch = Channel::new(Weak::new(), 7);
        let order = Arc::new(Mutex::new(Vec::new()));
        let seq = Arc::new(AtomicUsize::new(0));

        let push = |tag: &'static str| {
            let order = Arc::clone(&order);
            let seq = Arc::clone(&seq);
            move || {
                let n = seq.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push((n, tag));
            }
        };
        ch.set_close_callback(push("close"));
        ch.set_error_callback(push("error"));
        {
            let order = Arc::clone(&order);
            let seq = Arc::clone(&seq);
            ch.set_read_callback(move |_ts| {
                let n = seq.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push((n, "read"));
            });
        }
        ch.set_write_callback(push("write"));

        // Hang-up without readable, plus error, plus writable.
        ch.set_ready(EventSet::HANGUP | EventSet::ERROR | EventSet::WRITABLE);
        ch.handle_event(Timestamp::now());
        {
            let got = order.lock().unwrap().clone();
            assert_eq!(
                got,
                vec![(0, "close"), (1, "error"), (2, "write")],
                "close precedes error precedes write"
            );
        }

        // Hang-up with readable routes through read, not close.
        order.lock().unwrap().clear();
        ch.set_ready(EventSet::HANGUP | EventSet::READABLE);
        ch.handle_event(Timestamp::now());
        let got: Vec<&str> = order.lock().unwrap().iter().map(|(_, t)| *t).collect();
        assert_eq!(got, vec!["read"]);
    }

    #[test]
    fn tied_dispatch_drops_events_for_a_gone_owner() {
        let ch = Channel::new(Weak::new(), 7);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            ch.set_read_callback(move |_ts| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        let owner = Arc::new(String::from("owner"));
        ch.tie(&owner);
        ch.set_ready(EventSet::READABLE);
        ch.handle_event(Timestamp::now());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(owner);
        ch.handle_event(Timestamp::now());
        assert_eq!(
            fired.load(Ordering::SeqCst),
            1,
            "an event after the owner died must be dropped"
        );
    }
}
