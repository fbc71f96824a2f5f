use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::UnixAddr;
use shmbuf::{Buffer, ShmBufError};
use tracing::{debug, warn};

use crate::transport::Transport;

/// One outstanding `get_subbuffer` call: the data-ready handle it waits
/// on, the address its single reply goes to, and the ring it will claim
/// from. The handle is an owned duplicate, closed when the entry goes.
pub struct PendingConsumerRequest {
    producer_fd: OwnedFd,
    reply_to: UnixAddr,
    buffer: Arc<Buffer>,
}

impl PendingConsumerRequest {
    pub fn new(producer_fd: OwnedFd, reply_to: UnixAddr, buffer: Arc<Buffer>) -> Self {
        PendingConsumerRequest {
            producer_fd,
            reply_to,
            buffer,
        }
    }
}

/// Consumers blocked waiting for producer data, in registration order.
/// Each entry yields exactly one reply over its lifetime: `"OK <token>"`
/// once a subbuffer is claimed, or `"END"` when the producer side closes.
pub struct BlockedConsumers {
    entries: Vec<PendingConsumerRequest>,
}

impl BlockedConsumers {
    pub fn new() -> Self {
        BlockedConsumers {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, request: PendingConsumerRequest) {
        debug!(pending = self.entries.len() + 1, "consumer waiting for data");
        self.entries.push(request);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, closing the owned handles. Nothing is replied;
    /// used when the registrations cannot outlive a process event (fork).
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(discarded = self.entries.len(), "discarding blocked consumers");
        }
        self.entries.clear();
    }

    /// One non-blocking sweep: poll every entry's data-ready handle with
    /// zero timeout and resolve the ready ones, in registration order.
    pub fn service(&mut self, transport: &Transport) {
        if self.entries.is_empty() {
            return;
        }

        let mut fds = Vec::new();
        if let Err(e) = fds.try_reserve(self.entries.len()) {
            warn!(error = %e, "cannot build poll set, skipping service pass");
            return;
        }
        fds.extend(
            self.entries
                .iter()
                .map(|entry| PollFd::new(entry.producer_fd.as_fd(), PollFlags::POLLIN)),
        );

        let ready = loop {
            match poll(&mut fds, PollTimeout::ZERO) {
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "polling blocked consumers failed");
                    return;
                }
                Ok(n) => break n,
            }
        };
        if ready == 0 {
            return;
        }

        let ready_flags: Vec<bool> = fds
            .iter()
            .map(|fd| fd.revents().is_some_and(|r| !r.is_empty()))
            .collect();
        drop(fds);

        let mut index = 0;
        self.entries.retain(|entry| {
            let ready = ready_flags[index];
            index += 1;
            if !ready {
                return true;
            }
            !resolve(entry, transport)
        });
    }
}

impl Default for BlockedConsumers {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns true once the entry has received its reply and must go.
fn resolve(entry: &PendingConsumerRequest, transport: &Transport) -> bool {
    let mut byte = [0u8; 1];
    let n = match nix::unistd::read(entry.producer_fd.as_raw_fd(), &mut byte) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "reading data-ready handle failed");
            return false;
        }
    };

    if n == 0 {
        debug!("producer closed, reporting end of data");
        if let Err(e) = transport.reply(&entry.reply_to, "END") {
            warn!(error = %e, "sending END reply failed");
        }
        return true;
    }

    match entry.buffer.get_subbuf() {
        Ok(token) => {
            if let Err(e) = transport.reply(&entry.reply_to, &format!("OK {}", token)) {
                warn!(error = %e, "sending subbuffer reply failed");
            }
            true
        }
        // the delivery raced with another claim on the same ring; the
        // entry stays registered for the next pass
        Err(ShmBufError::NoData) | Err(ShmBufError::Busy) => false,
        Err(e) => {
            warn!(error = %e, "claiming subbuffer failed");
            if let Err(e) = transport.reply(&entry.reply_to, "ERROR") {
                warn!(error = %e, "sending error reply failed");
            }
            true
        }
    }
}
