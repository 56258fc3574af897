use core::borrow::{Borrow, BorrowMut};
use core::cell::RefCell;
use core::cmp;
use critical_section::Mutex;

/// Capacity of each ring in [`DefaultBufferStore`].
pub const BUFFER_SIZE: usize = 256;

/// A byte buffer that allows block access without extra copies but moves unread data to the
/// front when it runs out of room at the end.
///
/// wpos points to the first byte that can be written, rpos points at the next byte that can be
/// read.
///
/// invariants: 0 <= rpos <= wpos <= data.len()
pub struct Buffer<S: BorrowMut<[u8]>> {
    store: S,
    rpos: usize,
    wpos: usize,
}

impl<S: BorrowMut<[u8]>> Buffer<S> {
    pub const fn new(store: S) -> Self {
        Self {
            store,
            rpos: 0,
            wpos: 0,
        }
    }

    // Clears the buffer
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    pub fn capacity(&self) -> usize {
        self.store.borrow().len()
    }

    // Amount of bytes available for reading
    pub fn available_read(&self) -> usize {
        self.wpos - self.rpos
    }

    // Amount of space in bytes available for writing
    pub fn available_write(&self) -> usize {
        self.available_write_without_discard() + self.rpos
    }

    fn available_write_without_discard(&self) -> usize {
        self.capacity() - self.wpos
    }

    // Writes as much as possible of data to the buffer and returns the number of bytes written
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.len() > self.available_write_without_discard() && self.rpos > 0 {
            // data doesn't fit in already available space, and there is data to discard
            self.discard_already_read_data();
        }

        let count = cmp::min(self.available_write_without_discard(), data.len());
        if count == 0 {
            // Buffer is full (or data is empty)
            return 0;
        }

        self.store.borrow_mut()[self.wpos..self.wpos + count].copy_from_slice(&data[..count]);

        self.wpos += count;
        count
    }

    // Reserves max_count bytes of space for writing, and passes a slice pointing to them to a
    // closure for writing. The closure returns the number of bytes actually written and may
    // write less than max_count. If the closure returns an error, any written data is ignored.
    // Returns Ok(0) without calling the closure if max_count bytes don't fit.
    pub fn write_all<E>(
        &mut self,
        max_count: usize,
        f: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        if max_count > self.available_write_without_discard() {
            if max_count > self.available_write() {
                return Ok(0);
            }

            self.discard_already_read_data();
        }

        let wpos = self.wpos;
        let count = f(&mut self.store.borrow_mut()[wpos..wpos + max_count])?;
        let count = cmp::min(count, max_count);
        self.wpos += count;
        Ok(count)
    }

    // Takes up to max_count bytes from the buffer and passes a slice pointing to them to a
    // closure for reading. The closure returns the number of bytes actually consumed. If the
    // closure returns an error, the data stays in the buffer.
    pub fn read<E>(
        &mut self,
        max_count: usize,
        f: impl FnOnce(&[u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        let count = cmp::min(max_count, self.available_read());

        let consumed = f(&self.store.borrow()[self.rpos..self.rpos + count])?;
        let consumed = cmp::min(consumed, count);
        self.rpos += consumed;
        if self.rpos == self.wpos {
            self.clear();
        }
        Ok(consumed)
    }

    // Copies as many bytes as fit into dest and consumes them
    pub fn read_into(&mut self, dest: &mut [u8]) -> usize {
        let result: Result<usize, core::convert::Infallible> = self.read(dest.len(), |data| {
            dest[..data.len()].copy_from_slice(data);
            Ok(data.len())
        });

        match result {
            Ok(count) => count,
            Err(never) => match never {},
        }
    }

    fn discard_already_read_data(&mut self) {
        let (rpos, wpos) = (self.rpos, self.wpos);
        self.store.borrow_mut().copy_within(rpos..wpos, 0);

        self.wpos -= self.rpos;
        self.rpos = 0;
    }
}

/// Default backing store for the ring buffers.
pub struct DefaultBufferStore([u8; BUFFER_SIZE]);

impl DefaultBufferStore {
    pub const fn new() -> Self {
        Self([0; BUFFER_SIZE])
    }
}

impl Default for DefaultBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Borrow<[u8]> for DefaultBufferStore {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl BorrowMut<[u8]> for DefaultBufferStore {
    fn borrow_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Byte storage the driver moves data through.
///
/// The driver only uses these operations from task context, under the gate of the matching
/// direction. The USB stack fills (receive) or drains (transmit) the same storage from interrupt
/// context, so an implementation has to be safe for one task-side user and one interrupt-side
/// user at the same time.
pub trait UsbBuffer {
    /// Whether at least one byte can be read.
    fn data_available(&self) -> bool;

    /// Number of bytes `write` would accept right now.
    fn space_available(&self) -> usize;

    /// Moves up to `dest.len()` bytes out of the buffer and returns how many were moved.
    fn read(&self, dest: &mut [u8]) -> usize;

    /// Copies as much of `src` as fits into the buffer and returns how many bytes were taken.
    fn write(&self, src: &[u8]) -> usize;

    /// Drops everything in the buffer and rewinds its cursors.
    fn init(&self);
}

impl<B: UsbBuffer + ?Sized> UsbBuffer for &B {
    fn data_available(&self) -> bool {
        (**self).data_available()
    }

    fn space_available(&self) -> usize {
        (**self).space_available()
    }

    fn read(&self, dest: &mut [u8]) -> usize {
        (**self).read(dest)
    }

    fn write(&self, src: &[u8]) -> usize {
        (**self).write(src)
    }

    fn init(&self) {
        (**self).init()
    }
}

/// A [`Buffer`] shared between task and interrupt context.
///
/// Every access runs inside a critical section, so the task side ([`UsbBuffer`]) and the stack
/// side ([`fill`](SharedBuffer::fill), [`drain`](SharedBuffer::drain)) never observe a half-moved
/// cursor. A `SharedBuffer` is usually placed in a `static`.
pub struct SharedBuffer<S: BorrowMut<[u8]> = DefaultBufferStore> {
    inner: Mutex<RefCell<Buffer<S>>>,
}

impl SharedBuffer<DefaultBufferStore> {
    /// Creates an empty buffer with [`BUFFER_SIZE`] bytes of storage.
    pub const fn new() -> Self {
        Self::with_store(DefaultBufferStore::new())
    }
}

impl Default for SharedBuffer<DefaultBufferStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BorrowMut<[u8]>> SharedBuffer<S> {
    /// Creates an empty buffer on top of `store`.
    pub const fn with_store(store: S) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Buffer::new(store))),
        }
    }

    /// Number of bytes waiting to be read.
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).available_read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack side of a receive buffer: reserves `max_count` contiguous bytes and lets `f` fill
    /// them. Returns `Ok(0)` without calling `f` when `max_count` bytes don't fit.
    pub fn fill<E>(
        &self,
        max_count: usize,
        f: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).write_all(max_count, f))
    }

    /// Stack side of a transmit buffer: hands up to `max_count` buffered bytes to `f` and
    /// consumes as many as `f` reports sent.
    pub fn drain<E>(
        &self,
        max_count: usize,
        f: impl FnOnce(&[u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).read(max_count, f))
    }
}

impl<S: BorrowMut<[u8]>> UsbBuffer for SharedBuffer<S> {
    fn data_available(&self) -> bool {
        !self.is_empty()
    }

    fn space_available(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).available_write())
    }

    fn read(&self, dest: &mut [u8]) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).read_into(dest))
    }

    fn write(&self, src: &[u8]) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).write(src))
    }

    fn init(&self) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).clear())
    }
}
