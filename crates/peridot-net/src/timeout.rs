//! Idle-connection timeout tracking.
//!
//! A lazy-deletion heap: `update` and `remove` touch only the fd→expiry
//! map, leaving stale heap entries behind. The once-a-second sweep pops
//! entries until the top is both current and unexpired, reinserting
//! refreshed ones along the way. Each sweep is O(k log n) in the number of
//! expired or stale entries, and timeouts are approximate by contract.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Callback invoked with each descriptor whose idle timer expired.
pub type TimeoutCallback = Box<dyn Fn(RawFd) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeoutEntry {
    fd: RawFd,
    expires_at: Instant,
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.expires_at
            .cmp(&other.expires_at)
            .then(self.fd.cmp(&other.fd))
    }
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<TimeoutEntry>>,
    expiries: HashMap<RawFd, Instant>,
}

/// Tracks per-descriptor idle deadlines and fires a callback on expiry.
pub struct TimeoutManager {
    timeout: Duration,
    on_timeout: TimeoutCallback,
    inner: Mutex<Inner>,
}

impl TimeoutManager {
    /// Creates a manager that fires `on_timeout` once a descriptor has been
    /// idle for `timeout`.
    pub fn new(timeout: Duration, on_timeout: impl Fn(RawFd) + Send + Sync + 'static) -> Self {
        Self {
            timeout,
            on_timeout: Box::new(on_timeout),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                expiries: HashMap::new(),
            }),
        }
    }

    /// Starts tracking `fd` with a fresh deadline.
    pub fn add(&self, fd: RawFd) {
        let expires_at = Instant::now() + self.timeout;
        let mut inner = self.inner.lock().expect("timeout lock poisoned");
        inner.heap.push(Reverse(TimeoutEntry { fd, expires_at }));
        inner.expiries.insert(fd, expires_at);
    }

    /// Pushes `fd`'s deadline out by a full timeout. The stale heap entry is
    /// left in place for the sweep to fix up.
    pub fn update(&self, fd: RawFd) {
        let mut inner = self.inner.lock().expect("timeout lock poisoned");
        if let Some(expiry) = inner.expiries.get_mut(&fd) {
            *expiry = Instant::now() + self.timeout;
        }
    }

    /// Stops tracking `fd`. Heap remnants are dropped lazily by the sweep.
    pub fn remove(&self, fd: RawFd) {
        self.inner
            .lock()
            .expect("timeout lock poisoned")
            .expiries
            .remove(&fd);
    }

    /// Number of descriptors currently tracked.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("timeout lock poisoned")
            .expiries
            .len()
    }

    /// True if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires the callback for every expired descriptor.
    ///
    /// Callbacks run with the internal lock released, so they may call back
    /// into `add`/`update`/`remove`.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock().expect("timeout lock poisoned");
            let Inner { heap, expiries } = &mut *inner;
            while let Some(&Reverse(top)) = heap.peek() {
                match expiries.get(&top.fd).copied() {
                    // Removed while its heap entry lingered.
                    None => {
                        heap.pop();
                    }
                    // Refreshed since this entry was pushed; reinsert at the
                    // real deadline.
                    Some(current) if current > top.expires_at => {
                        heap.pop();
                        heap.push(Reverse(TimeoutEntry {
                            fd: top.fd,
                            expires_at: current,
                        }));
                    }
                    Some(current) => {
                        if current <= now {
                            heap.pop();
                            expiries.remove(&top.fd);
                            expired.push(top.fd);
                        } else {
                            // Top is current and in the future: done.
                            break;
                        }
                    }
                }
            }
        }
        for fd in expired {
            debug!(fd, "idle timeout");
            (self.on_timeout)(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counting_manager(timeout: Duration) -> (Arc<TimeoutManager>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let mgr = Arc::new(TimeoutManager::new(timeout, move |_fd| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        }));
        (mgr, fired)
    }

    #[test]
    fn does_not_fire_before_expiry() {
        let (mgr, fired) = counting_manager(Duration::from_millis(300));
        mgr.add(5);
        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn fires_exactly_once_after_expiry() {
        let (mgr, fired) = counting_manager(Duration::from_millis(50));
        mgr.add(5);
        thread::sleep(Duration::from_millis(120));
        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(mgr.is_empty());

        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "no double fire");
    }

    #[test]
    fn update_defers_the_deadline() {
        let (mgr, fired) = counting_manager(Duration::from_millis(200));
        mgr.add(5);
        thread::sleep(Duration::from_millis(120));
        mgr.update(5);

        // Past the original deadline but not the refreshed one.
        thread::sleep(Duration::from_millis(120));
        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(150));
        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_suppresses_future_fires() {
        let (mgr, fired) = counting_manager(Duration::from_millis(50));
        mgr.add(5);
        mgr.remove(5);
        thread::sleep(Duration::from_millis(120));
        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(mgr.is_empty());
    }

    #[test]
    fn update_on_an_untracked_fd_is_a_no_op() {
        let (mgr, fired) = counting_manager(Duration::from_millis(50));
        mgr.update(99);
        thread::sleep(Duration::from_millis(80));
        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recycled_fd_gets_a_fresh_deadline() {
        let (mgr, fired) = counting_manager(Duration::from_millis(100));
        // First connection on fd 5 goes away; its heap entry lingers.
        mgr.add(5);
        mgr.remove(5);
        // The descriptor number is reused by a new connection.
        mgr.add(5);
        thread::sleep(Duration::from_millis(150));
        mgr.sweep();
        assert_eq!(
            fired.load(Ordering::SeqCst),
            1,
            "the recycled fd expires once, on the new deadline"
        );
    }

    #[test]
    fn expires_many_in_one_sweep() {
        let (mgr, fired) = counting_manager(Duration::from_millis(50));
        for fd in 0..10 {
            mgr.add(fd);
        }
        thread::sleep(Duration::from_millis(120));
        mgr.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert!(mgr.is_empty());
    }

    #[test]
    fn callback_may_reenter_the_manager() {
        let mgr = Arc::new(Mutex::new(None::<Arc<TimeoutManager>>));
        let mgr_for_cb = Arc::clone(&mgr);
        let built = Arc::new(TimeoutManager::new(Duration::from_millis(50), move |fd| {
            // Re-adding from inside the callback must not deadlock.
            if let Some(m) = mgr_for_cb.lock().unwrap().as_ref() {
                m.add(fd + 100);
            }
        }));
        *mgr.lock().unwrap() = Some(Arc::clone(&built));

        built.add(1);
        thread::sleep(Duration::from_millis(80));
        built.sweep();
        assert_eq!(built.len(), 1, "the callback re-added a descriptor");
    }
}
