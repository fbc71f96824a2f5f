//! # shmbuf - shared-memory subbuffer rings
//!
//! Per-CPU trace buffers backed by System-V shared memory, carved into
//! fixed-size subbuffers that a producer fills in-process and a consumer
//! daemon claims and releases from outside.
//!
//! Each buffer owns two shared memory segments: the data segment holding
//! the subbuffers themselves, and a small control segment holding the
//! consumed/produced position atomics, so a separate process can map both
//! by id and follow consumption progress. Data readiness is signaled over
//! a pipe; the read end is handed to whoever waits for the buffer, and a
//! zero-byte read on it means the producer side has shut down.
//!
//! ## Claim and release
//!
//! ```no_run
//! use shmbuf::{Buffer, ChannelConfig};
//!
//! let buffer = Buffer::new(&ChannelConfig::default())?;
//! // producer side
//! buffer.write_event(b"payload")?;
//! buffer.deliver_subbuf()?;
//! // consumer side
//! let token = buffer.get_subbuf()?;
//! let bytes = buffer.subbuf(token);
//! buffer.put_subbuf(token)?;
//! # Ok::<(), shmbuf::ShmBufError>(())
//! ```
//!
//! `get_subbuf` hands out a consumed-offset token representing the claim;
//! the claim is single-owner until `put_subbuf` returns it with the same
//! token. A release with a stale token fails and leaves the ring intact.

pub use buffer::Buffer;
pub use channel::{num_cpus, Channel, ChannelConfig};
pub use error::ShmBufError;
pub use shm::ShmSegment;

mod buffer;
mod channel;
mod error;
mod shm;
