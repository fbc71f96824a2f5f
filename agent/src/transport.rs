use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, recvfrom, sendto, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tracing::debug;

use crate::Result;

/// The per-process control channel: one unix datagram socket bound at
/// `<dir>/<pid>`, receiving plain-text commands from the consumer daemon
/// and replying to whichever address sent them. Datagram boundaries carry
/// the message framing.
pub struct Transport {
    fd: OwnedFd,
    path: PathBuf,
    daemon_path: PathBuf,
    owner_pid: u32,
}

impl Transport {
    pub fn bind(dir: &Path, pid: u32) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(pid.to_string());
        let _ = std::fs::remove_file(&path);

        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        bind(fd.as_raw_fd(), &UnixAddr::new(&path)?)?;
        debug!(path = %path.display(), "control socket bound");

        Ok(Transport {
            fd,
            path,
            daemon_path: dir.join("daemon"),
            owner_pid: std::process::id(),
        })
    }

    /// Wait up to `timeout` for one command datagram; `None` on timeout.
    /// The poll is restarted when interrupted by a signal.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<(String, UnixAddr)>> {
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

        let mut buf = [0u8; protocol::MAX_MESSAGE_LEN];
        let (len, addr) = recvfrom::<UnixAddr>(self.fd.as_raw_fd(), &mut buf)?;
        let addr = addr.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "datagram without sender address",
            )
        })?;

        let text = String::from_utf8_lossy(&buf[..len]).trim().to_string();
        Ok(Some((text, addr)))
    }

    /// Send one reply datagram back to a command's sender.
    pub fn reply(&self, to: &UnixAddr, text: &str) -> Result<()> {
        sendto(self.fd.as_raw_fd(), text.as_bytes(), to, MsgFlags::empty())?;
        Ok(())
    }

    /// Fire one announcement datagram at the consumer daemon's socket.
    pub fn notify_daemon(&self, text: &str) -> Result<()> {
        let daemon = UnixAddr::new(&self.daemon_path)?;
        sendto(self.fd.as_raw_fd(), text.as_bytes(), &daemon, MsgFlags::empty())?;
        Ok(())
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // a forked child drops the inherited transport but must not unlink
        // the parent's socket file
        if self.owner_pid == std::process::id() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
