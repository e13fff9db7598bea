//! Bounded byte queues backing a connection's input and output.

/// Fixed-capacity queue of received bytes awaiting delivery.
#[derive(Debug)]
pub struct InputBuffer {
    buf: Box<[u8]>,
    len: usize,
}

impl InputBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        InputBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if no more bytes can be read in.
    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Unused tail to read new bytes into; commit them with [Self::advance].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Marks `n` bytes of the spare tail as filled.
    pub fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buf.len());
    }

    /// Appends as much of `data` as fits, returning the number of bytes taken.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Delivers and clears everything buffered.
    pub fn drain_all(&mut self, mut deliver: impl FnMut(&[u8])) {
        if self.len > 0 {
            deliver(&self.buf[..self.len]);
            self.len = 0;
        }
    }

    /// Delivers each complete `\n`-terminated line, without the terminator or
    /// a preceding `\r`, oldest first. Delivery stops early once `deliver`
    /// returns `false`.
    ///
    /// An incomplete trailing line stays buffered. If the buffer is full and
    /// holds no terminator at all, its whole content is delivered as one chunk
    /// so the connection keeps making progress.
    pub fn drain_lines(&mut self, mut deliver: impl FnMut(&[u8]) -> bool) {
        let mut start = 0;
        let mut stopped = false;

        while let Some(pos) = self.buf[start..self.len].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let line = match &self.buf[start..end] {
                [rest @ .., b'\r'] => rest,
                line => line,
            };
            start = end + 1;

            if !deliver(line) {
                stopped = true;
                break;
            }
        }

        self.consume(start);

        if !stopped && self.is_full() {
            self.drain_all(|chunk| {
                deliver(chunk);
            });
        }
    }

    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

/// Fixed-capacity queue of bytes waiting to be written.
///
/// Written bytes are not removed right away: a consumed-prefix offset is
/// advanced instead, and the live bytes are only moved to the front once the
/// prefix exceeds half the capacity. `offset + pending` never exceeds the
/// capacity.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    offset: usize,
    capacity: usize,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        OutputBuffer {
            data: Vec::with_capacity(capacity),
            offset: 0,
            capacity,
        }
    }

    /// Bytes still to be written.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Number of bytes still to be written.
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns `true` if nothing is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the consumed prefix not yet compacted away.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Maximum number of bytes the buffer holds, consumed prefix included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends as much of `data` as fits and silently drops the rest,
    /// returning the number of bytes queued.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity - self.data.len());
        self.data.extend_from_slice(&data[..n]);
        n
    }

    /// Removes `n` written bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());

        if self.offset == self.data.len() {
            self.data.clear();
            self.offset = 0;
        } else if self.offset > self.capacity / 2 {
            self.data.drain(..self.offset);
            self.offset = 0;
        }
    }

    /// Drops everything queued.
    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
    }
}
