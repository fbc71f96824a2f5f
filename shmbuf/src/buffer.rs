use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nix::fcntl::OFlag;
use parking_lot::Mutex;
use tracing::trace;

use crate::channel::ChannelConfig;
use crate::shm::ShmSegment;
use crate::ShmBufError;

/// Consumption accounting shared with the consumer process, placed at the
/// start of the control segment. Positions are byte offsets that grow
/// monotonically; the ring offset is the position modulo capacity.
#[repr(C)]
pub(crate) struct BufferShared {
    consumed: AtomicU64,
    produced: AtomicU64,
}

impl BufferShared {
    fn new() -> Self {
        BufferShared {
            consumed: AtomicU64::new(0),
            produced: AtomicU64::new(0),
        }
    }
}

/// One per-CPU subbuffer ring.
///
/// The producer side fills the open subbuffer with `write_event` and
/// publishes it with `deliver_subbuf`, which also signals the data-ready
/// pipe. The consumer side claims the oldest published subbuffer with
/// `get_subbuf` and returns it with `put_subbuf`.
pub struct Buffer {
    data: ShmSegment,
    control: ShmSegment,
    subbuf_size: usize,
    n_subbufs: usize,
    // byte offset into the open subbuffer; the lock also serializes producers
    write_offset: Mutex<usize>,
    claimed: AtomicBool,
    ready_read: OwnedFd,
    ready_write: Mutex<Option<OwnedFd>>,
}

impl Buffer {
    pub fn new(config: &ChannelConfig) -> Result<Self, ShmBufError> {
        if !config.subbuf_size.is_power_of_two() {
            return Err(ShmBufError::SizeNotPowerOfTwo(config.subbuf_size));
        }
        if !config.n_subbufs.is_power_of_two() {
            return Err(ShmBufError::CountNotPowerOfTwo(config.n_subbufs));
        }

        let data = ShmSegment::new(config.subbuf_size * config.n_subbufs)?;
        let control = ShmSegment::new(std::mem::size_of::<BufferShared>())?;

        unsafe {
            (control.as_ptr().as_ptr() as *mut BufferShared).write(BufferShared::new());
        }

        let (ready_read, ready_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;

        Ok(Buffer {
            data,
            control,
            subbuf_size: config.subbuf_size,
            n_subbufs: config.n_subbufs,
            write_offset: Mutex::new(0),
            claimed: AtomicBool::new(false),
            ready_read,
            ready_write: Mutex::new(Some(ready_write)),
        })
    }

    fn shared(&self) -> &BufferShared {
        unsafe { &*(self.control.as_ptr().as_ptr() as *const BufferShared) }
    }

    pub fn shmid(&self) -> i32 {
        self.data.id()
    }

    pub fn struct_shmid(&self) -> i32 {
        self.control.id()
    }

    pub fn subbuf_size(&self) -> usize {
        self.subbuf_size
    }

    pub fn n_subbufs(&self) -> usize {
        self.n_subbufs
    }

    fn capacity(&self) -> u64 {
        (self.subbuf_size * self.n_subbufs) as u64
    }

    /// Read end of the data-ready pipe. A byte arrives per delivered
    /// subbuffer; end-of-file means the producer side has shut down.
    pub fn data_ready_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.ready_read.as_fd()
    }

    /// Bytes published and not yet consumed.
    pub fn available_bytes(&self) -> u64 {
        let shared = self.shared();
        shared
            .produced
            .load(Ordering::Acquire)
            .saturating_sub(shared.consumed.load(Ordering::Acquire))
    }

    /// Append one record to the open subbuffer, publishing the subbuffer
    /// first if the record does not fit in the remaining space.
    pub fn write_event(&self, payload: &[u8]) -> Result<(), ShmBufError> {
        if payload.len() > self.subbuf_size {
            return Err(ShmBufError::RecordTooLarge {
                size: payload.len(),
                subbuf_size: self.subbuf_size,
            });
        }

        let mut offset = self.write_offset.lock();
        if *offset + payload.len() > self.subbuf_size {
            self.deliver_locked(&mut offset)?;
        }

        let shared = self.shared();
        let produced = shared.produced.load(Ordering::Acquire);
        if produced + self.subbuf_size as u64 - shared.consumed.load(Ordering::Acquire)
            > self.capacity()
        {
            return Err(ShmBufError::RingFull);
        }

        let start = (produced % self.capacity()) as usize + *offset;
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.data.as_ptr().as_ptr().add(start),
                payload.len(),
            );
        }
        *offset += payload.len();
        trace!(offset = *offset, len = payload.len(), "event written");

        if *offset == self.subbuf_size {
            self.deliver_locked(&mut offset)?;
        }

        Ok(())
    }

    /// Publish the open subbuffer and signal the data-ready pipe.
    pub fn deliver_subbuf(&self) -> Result<(), ShmBufError> {
        let mut offset = self.write_offset.lock();
        self.deliver_locked(&mut offset)
    }

    fn deliver_locked(&self, offset: &mut usize) -> Result<(), ShmBufError> {
        let shared = self.shared();
        let produced = shared.produced.load(Ordering::Acquire);
        let consumed = shared.consumed.load(Ordering::Acquire);

        if produced + self.subbuf_size as u64 - consumed > self.capacity() {
            return Err(ShmBufError::RingFull);
        }

        shared
            .produced
            .store(produced + self.subbuf_size as u64, Ordering::Release);
        *offset = 0;

        if let Some(writer) = self.ready_write.lock().as_ref() {
            let _ = nix::unistd::write(writer, &[1u8]);
        }

        trace!(
            produced = produced + self.subbuf_size as u64,
            consumed = consumed,
            "subbuffer delivered"
        );

        Ok(())
    }

    /// Claim the oldest published subbuffer, returning the consumed-offset
    /// token representing the claim. The claim is single-owner until
    /// released with `put_subbuf`.
    pub fn get_subbuf(&self) -> Result<u64, ShmBufError> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(ShmBufError::Busy);
        }

        let shared = self.shared();
        let consumed = shared.consumed.load(Ordering::Acquire);
        let produced = shared.produced.load(Ordering::Acquire);

        if produced < consumed + self.subbuf_size as u64 {
            self.claimed.store(false, Ordering::Release);
            return Err(ShmBufError::NoData);
        }

        Ok(consumed)
    }

    /// The byte range of the subbuffer addressed by a claim token.
    pub fn subbuf(&self, token: u64) -> &[u8] {
        let start = (token % self.capacity()) as usize;
        unsafe {
            std::slice::from_raw_parts(self.data.as_ptr().as_ptr().add(start), self.subbuf_size)
        }
    }

    /// Release a claimed subbuffer, yielding the new consumed offset. A
    /// token that does not match the current consumed offset fails without
    /// advancing the ring.
    pub fn put_subbuf(&self, consumed_old: u64) -> Result<u64, ShmBufError> {
        let shared = self.shared();
        let consumed = shared.consumed.load(Ordering::Acquire);

        if consumed_old != consumed {
            return Err(ShmBufError::StaleToken {
                expected: consumed,
                got: consumed_old,
            });
        }
        if shared.produced.load(Ordering::Acquire) < consumed + self.subbuf_size as u64 {
            return Err(ShmBufError::NoData);
        }

        let consumed_new = consumed + self.subbuf_size as u64;
        shared.consumed.store(consumed_new, Ordering::Release);
        self.claimed.store(false, Ordering::Release);

        Ok(consumed_new)
    }

    /// Close the producer end of the data-ready pipe. Anyone polling the
    /// read end observes end-of-file, the end-of-data condition.
    pub fn shutdown(&self) {
        let writer = self.ready_write.lock().take();
        if writer.is_some() {
            trace!(fd = self.ready_read.as_raw_fd(), "producer side shut down");
        }
    }
}
