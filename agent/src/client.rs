use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, recvfrom, sendto, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tracing::debug;

use crate::Result;

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// The consumer daemon's side of the control channel, used by the
/// integration tests: an own bound datagram socket that sends one verb at
/// a time to an agent and awaits the reply.
pub struct ConsumerClient {
    fd: OwnedFd,
    path: PathBuf,
    agent_addr: UnixAddr,
}

impl ConsumerClient {
    /// Bind a fresh client socket in `dir`, targeting the agent of `pid`.
    pub fn bind(dir: &Path, agent_pid: u32) -> Result<Self> {
        let seq = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("client-{}-{}", std::process::id(), seq));
        Self::bind_at(path, dir.join(agent_pid.to_string()))
    }

    /// Bind the daemon announcement socket at `<dir>/daemon`.
    pub fn bind_daemon(dir: &Path, agent_pid: u32) -> Result<Self> {
        Self::bind_at(dir.join("daemon"), dir.join(agent_pid.to_string()))
    }

    fn bind_at(path: PathBuf, agent_path: PathBuf) -> Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        bind(fd.as_raw_fd(), &UnixAddr::new(&path)?)?;
        debug!(path = %path.display(), "client socket bound");

        Ok(ConsumerClient {
            fd,
            path,
            agent_addr: UnixAddr::new(&agent_path)?,
        })
    }

    pub fn send(&self, command: &str) -> Result<()> {
        sendto(
            self.fd.as_raw_fd(),
            command.as_bytes(),
            &self.agent_addr,
            MsgFlags::empty(),
        )?;
        Ok(())
    }

    /// Wait up to `timeout` for one datagram; `None` when nothing came.
    pub fn recv(&self, timeout: Duration) -> Result<Option<String>> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16);

        let ready = loop {
            match poll(&mut fds, timeout) {
                Err(Errno::EINTR) => continue,
                other => break other?,
            }
        };
        if ready == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 8192];
        let (len, _) = recvfrom::<UnixAddr>(self.fd.as_raw_fd(), &mut buf)?;
        Ok(Some(String::from_utf8_lossy(&buf[..len]).to_string()))
    }

    /// Send one verb and await its reply.
    pub fn request(&self, command: &str, timeout: Duration) -> Result<Option<String>> {
        self.send(command)?;
        self.recv(timeout)
    }
}

impl Drop for ConsumerClient {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
