//! Growable byte region with separate read and write cursors.

use std::io;
use std::os::fd::RawFd;

/// Default initial capacity for a fresh buffer.
pub const INITIAL_CAPACITY: usize = 4096;

/// A byte region addressed by two cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0              read_pos           write_pos           capacity
/// ```
///
/// `0 <= read_pos <= write_pos <= capacity` holds after every operation.
/// Appending past the writable region first compacts already-consumed space
/// to the front, and only reallocates when compaction cannot make room. A
/// fully drained buffer snaps both cursors back to zero.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Creates an empty buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes available to read: `write_pos - read_pos`.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available to write: `capacity - write_pos`.
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Already-consumed bytes at the front that can be reclaimed.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The readable region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Appends `bytes`, compacting or growing as needed.
    ///
    /// # Panics
    ///
    /// Panics if the buffer cannot provide space even after compaction and
    /// reallocation; that indicates a broken growth path, not a runtime
    /// condition.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.ensure_writable(bytes.len());
        assert!(
            self.writable_bytes() >= bytes.len(),
            "buffer growth failed: need {} writable, have {}",
            bytes.len(),
            self.writable_bytes()
        );
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Consumes `n` readable bytes (all of them if `n` overshoots).
    pub fn retrieve(&mut self, n: usize) {
        if n < self.readable_bytes() {
            self.read_pos += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Drains the buffer and resets both cursors to zero.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Copies out and consumes up to `n` readable bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_bytes());
        let out = self.data[self.read_pos..self.read_pos + n].to_vec();
        self.retrieve(n);
        out
    }

    /// Copies out and consumes the whole readable region.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.take(self.readable_bytes())
    }

    /// Reads once from `fd` into the writable region, growing first if the
    /// buffer is full.
    ///
    /// Retries on EINTR. `Ok(0)` is orderly EOF; `WouldBlock` means the
    /// descriptor has nothing more right now; other errors are fatal to the
    /// descriptor and keep the OS error for the caller.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        if self.writable_bytes() == 0 {
            self.ensure_writable(1);
        }
        loop {
            let n = unsafe {
                libc::read(
                    fd,
                    self.data[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                    self.writable_bytes(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let n = n as usize;
            self.write_pos += n;
            return Ok(n);
        }
    }

    /// Writes the readable region to `fd` once, retrying on EINTR.
    ///
    /// Consumes whatever the kernel accepted; a fully drained buffer resets
    /// its cursors.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        if self.readable_bytes() == 0 {
            return Ok(0);
        }
        loop {
            let n = unsafe {
                libc::write(
                    fd,
                    self.data[self.read_pos..].as_ptr() as *const libc::c_void,
                    self.readable_bytes(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let n = n as usize;
            self.read_pos += n;
            if self.read_pos == self.write_pos {
                self.retrieve_all();
            }
            return Ok(n);
        }
    }

    /// Makes at least `need` bytes writable: compact if the reclaimed front
    /// plus the tail suffices, otherwise reallocate to
    /// `max(2 * capacity, capacity + need)` and compact.
    fn ensure_writable(&mut self, need: usize) {
        if self.writable_bytes() >= need {
            return;
        }
        let readable = self.readable_bytes();
        if self.prependable_bytes() + self.writable_bytes() >= need {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
        } else {
            let new_capacity = usize::max(self.capacity() * 2, self.capacity() + need);
            let mut grown = vec![0u8; new_capacity];
            grown[..readable].copy_from_slice(&self.data[self.read_pos..self.write_pos]);
            self.data = grown;
        }
        self.read_pos = 0;
        self.write_pos = readable;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::RawFd;

    fn assert_cursor_invariant(buf: &Buffer) {
        assert!(buf.read_pos <= buf.write_pos);
        assert!(buf.write_pos <= buf.capacity());
    }

    /// A non-blocking pipe for exercising the fd paths against a real kernel
    /// object. Closes both ends on drop.
    struct Pipe {
        read_fd: RawFd,
        write_fd: RawFd,
    }

    impl Pipe {
        fn new() -> Self {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            assert_eq!(rc, 0, "pipe2 failed");
            Self {
                read_fd: fds[0],
                write_fd: fds[1],
            }
        }

        fn feed(&self, bytes: &[u8]) {
            let n = unsafe {
                libc::write(
                    self.write_fd,
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            assert_eq!(n as usize, bytes.len());
        }

        fn close_write(&mut self) {
            if self.write_fd >= 0 {
                unsafe { libc::close(self.write_fd) };
                self.write_fd = -1;
            }
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            unsafe { libc::close(self.read_fd) };
            self.close_write();
        }
    }

    #[test]
    fn append_take_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_cursor_invariant(&buf);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.take(11), b"hello world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_cursor_invariant(&buf);
    }

    #[test]
    fn retrieve_partial_then_all() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve(2);
        assert_eq!(buf.as_slice(), b"cdef");
        assert_eq!(buf.prependable_bytes(), 2);
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), 0, "full drain resets cursors");
        assert_cursor_invariant(&buf);
    }

    #[test]
    fn append_compacts_before_reallocating() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1; 12]);
        buf.retrieve(8);
        // 4 writable + 8 prependable can host 10 more bytes without growing.
        buf.append(&[2; 10]);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.readable_bytes(), 14);
        assert_eq!(buf.prependable_bytes(), 0);
        assert_eq!(&buf.as_slice()[..4], &[1, 1, 1, 1]);
        assert_cursor_invariant(&buf);
    }

    #[test]
    fn append_grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[7; 10]);
        buf.append(&[8; 20]);
        // max(2 * 16, 16 + 20) = 36
        assert_eq!(buf.capacity(), 36);
        assert_eq!(buf.readable_bytes(), 30);
        assert_eq!(&buf.take_all()[..10], &[7; 10]);
        assert_cursor_invariant(&buf);
    }

    #[test]
    fn growth_doubles_for_small_needs() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[1; 32]);
        buf.append(&[2; 1]);
        // max(2 * 32, 32 + 1) = 64
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.readable_bytes(), 33);
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(&[]);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn read_from_fd_delivers_pipe_bytes() {
        let pipe = Pipe::new();
        pipe.feed(b"ping");

        let mut buf = Buffer::new();
        let n = buf.read_from_fd(pipe.read_fd).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.as_slice(), b"ping");
    }

    #[test]
    fn read_from_fd_would_block_on_empty_pipe() {
        let pipe = Pipe::new();
        let mut buf = Buffer::new();
        let err = buf.read_from_fd(pipe.read_fd).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn read_from_fd_reports_eof_as_zero() {
        let mut pipe = Pipe::new();
        pipe.feed(b"x");
        pipe.close_write();

        let mut buf = Buffer::new();
        assert_eq!(buf.read_from_fd(pipe.read_fd).unwrap(), 1);
        assert_eq!(buf.read_from_fd(pipe.read_fd).unwrap(), 0, "orderly EOF");
    }

    #[test]
    fn exactly_full_buffer_grows_on_next_read() {
        let pipe = Pipe::new();
        pipe.feed(&[9; 12]);

        let mut buf = Buffer::with_capacity(8);
        assert_eq!(buf.read_from_fd(pipe.read_fd).unwrap(), 8);
        assert_eq!(buf.writable_bytes(), 0);

        // The buffer is exactly full; the next read must grow or compact
        // first and then pick up the remaining bytes.
        assert_eq!(buf.read_from_fd(pipe.read_fd).unwrap(), 4);
        assert_eq!(buf.readable_bytes(), 12);
        assert!(buf.capacity() >= 12);
        assert_cursor_invariant(&buf);
    }

    #[test]
    fn write_to_fd_consumes_what_the_kernel_took() {
        let pipe = Pipe::new();
        let mut buf = Buffer::new();
        buf.append(b"pong");

        let n = buf.write_to_fd(pipe.write_fd).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), 0, "full drain resets cursors");

        let mut out = [0u8; 8];
        let got = unsafe { libc::read(pipe.read_fd, out.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(got, 4);
        assert_eq!(&out[..4], b"pong");
    }

    #[test]
    fn write_to_fd_on_empty_buffer_is_zero() {
        let pipe = Pipe::new();
        let mut buf = Buffer::new();
        assert_eq!(buf.write_to_fd(pipe.write_fd).unwrap(), 0);
    }
}
