//! Growable byte buffer used as both the input and output staging area of a
//! connection.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |    (CONTENT)     |                  |
//! +-------------------+------------------+------------------+
//! |                   |                  |                  |
//! 0      <=       reader      <=      writer      <=      size
//! ```
//!
//! The prependable region starts out as a small headroom so that a length or
//! type header can be inserted in front of already-written content without
//! reallocating. Retrieving advances `reader`, appending advances `writer`,
//! and a fully drained buffer resets both indices to the headroom.

use std::io;
use std::os::fd::RawFd;

/// Headroom reserved at the front of a fresh buffer for late header inserts.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity of `Buffer::new`.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-resident auxiliary region used by `read_fd`. A single
/// scatter read transfers at most `writable_bytes() + EXTRA_BUF_SIZE` bytes.
const EXTRA_BUF_SIZE: usize = 64 * 1024;

pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Buffer with `initial` writable bytes plus the prepend headroom.
    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            data: vec![0; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Offset of the first `\r\n` at or after `start` (readable-relative).
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| start + pos)
    }

    /// Offset of the first `\n` in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    /// Offset of the first `\n` at or after `start` (readable-relative).
    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    /// Drop `n` bytes from the front of the readable region.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Take `n` bytes off the front as a lossily-decoded string.
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        assert!(n <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..n]).into_owned();
        self.retrieve(n);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Take the whole readable region as a byte vector.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let v = self.peek().to_vec();
        self.retrieve_all();
        v
    }

    /// FIFO append at the writer end, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Insert `data` immediately in front of the readable region.
    ///
    /// Requires `data.len() <= prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.data[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    // Compaction first: moving the content left bounds memory when the front
    // of the buffer has already been consumed. Only grow when the combined
    // writable and reclaimed-prepend space still cannot hold `n`.
    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.data.resize(self.writer + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
        }
    }

    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u64(&mut self, x: u64) {
        self.append(&x.to_be_bytes());
    }

    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u64(&mut self, x: u64) {
        self.prepend(&x.to_be_bytes());
    }

    /// Read a big-endian `u8` without advancing the reader.
    pub fn peek_u8(&self) -> u8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0]
    }

    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        assert!(self.readable_bytes() >= 8);
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    /// Read a big-endian `u8` and advance the reader past it.
    pub fn read_u8(&mut self) -> u8 {
        let x = self.peek_u8();
        self.retrieve(1);
        x
    }

    pub fn read_u16(&mut self) -> u16 {
        let x = self.peek_u16();
        self.retrieve(2);
        x
    }

    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.retrieve(4);
        x
    }

    pub fn read_u64(&mut self) -> u64 {
        let x = self.peek_u64();
        self.retrieve(8);
        x
    }

    /// Scatter-read from `fd` into the writable tail and a 64 KiB stack
    /// region, so a large arrival lands in one syscall even when writable
    /// space is small. Overflow beyond the writable tail is absorbed through
    /// `append`, which grows the buffer.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.data[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];
        // With enough writable space there is no point paying the extra copy.
        let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}
