use core::ptr::NonNull;

use nix::errno::Errno;

use crate::ShmBufError;

/// One System-V shared memory segment, attached for the lifetime of the
/// value and marked for removal when dropped.
///
/// The segment id is the handle exchanged with the consumer daemon, which
/// attaches the same memory from its own process. Removal is only marked
/// on drop, so an id stays mappable for as long as the owning buffer is
/// alive.
pub struct ShmSegment {
    id: i32,
    ptr: NonNull<u8>,
    size: usize,
}

impl ShmSegment {
    pub fn new(size: usize) -> Result<Self, ShmBufError> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if id == -1 {
            return Err(ShmBufError::ShmFailed(Errno::last()));
        }

        let raw = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if raw == -1isize as *mut libc::c_void {
            let errno = Errno::last();
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
            return Err(ShmBufError::ShmFailed(errno));
        }

        let ptr = NonNull::new(raw as *mut u8).expect("shmat returned null pointer");

        Ok(ShmSegment { id, ptr, size })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::shmdt(self.ptr.as_ptr() as *const libc::c_void);
            let _ = libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_roundtrip() {
        let size = 4096;
        let segment = ShmSegment::new(size).unwrap();

        assert!(segment.id() >= 0);
        assert_eq!(segment.size(), size);

        let ptr = segment.as_ptr().as_ptr();
        unsafe {
            for i in 0..size {
                ptr.add(i).write((i % 251) as u8);
            }
            for i in 0..size {
                assert_eq!(ptr.add(i).read(), (i % 251) as u8, "mismatch at {}", i);
            }
        }
    }

    #[test]
    fn test_segment_zero_initialized() {
        let segment = ShmSegment::new(4096).unwrap();
        let ptr = segment.as_ptr().as_ptr();
        unsafe {
            for i in 0..segment.size() {
                assert_eq!(ptr.add(i).read(), 0);
            }
        }
    }

    #[test]
    fn test_second_attach_sees_writes() {
        let segment = ShmSegment::new(4096).unwrap();

        let other = unsafe { libc::shmat(segment.id(), std::ptr::null(), 0) };
        assert_ne!(other, -1isize as *mut libc::c_void);

        unsafe {
            segment.as_ptr().as_ptr().write(0xA5);
            assert_eq!((other as *const u8).read(), 0xA5);
            libc::shmdt(other);
        }
    }
}
