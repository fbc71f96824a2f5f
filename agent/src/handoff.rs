use std::sync::Arc;

use nix::sys::socket::UnixAddr;
use protocol::ChannelCpu;
use shmbuf::{Buffer, Channel};
use thiserror::Error;
use tracing::{debug, warn};

use crate::blocked::PendingConsumerRequest;
use crate::lifecycle::Agent;

/// The single fixed trace the hand-off verbs operate on.
pub(crate) const TRACE_NAME: &str = "auto";
pub(crate) const TRACE_TYPE: &str = "relay";

#[derive(Error, Debug)]
enum LookupError {
    #[error("cannot find trace \"{0}\"")]
    TraceNotFound(&'static str),
    #[error("channel not found ({0})")]
    ChannelNotFound(String),
}

fn find_channel(agent: &Agent, target: &ChannelCpu) -> Result<Arc<Channel>, LookupError> {
    let registry = agent.registry.lock();
    let trace = registry
        .find(TRACE_NAME)
        .ok_or(LookupError::TraceNotFound(TRACE_NAME))?;
    let channel = trace
        .channel(&target.channel)
        .ok_or_else(|| LookupError::ChannelNotFound(target.to_string()))?;
    if target.cpu >= channel.n_cpus() {
        return Err(LookupError::ChannelNotFound(target.to_string()));
    }
    Ok(channel.clone())
}

fn find_buffer(agent: &Agent, target: &ChannelCpu) -> Result<Arc<Buffer>, LookupError> {
    let channel = find_channel(agent, target)?;
    channel
        .buffer(target.cpu)
        .cloned()
        .map_err(|_| LookupError::ChannelNotFound(target.to_string()))
}

/// Reply `"<shmid> <struct_shmid>"` for one buffer and count it as handed
/// off. Lookup failures are logged without a reply.
pub(crate) fn get_shmid(agent: &Agent, target: &ChannelCpu, from: &UnixAddr) {
    debug!(target = %target, "get_shmid");

    let buffer = match find_buffer(agent, target) {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!(target = %target, error = %e, "get_shmid failed");
            return;
        }
    };

    let reply = format!("{} {}", buffer.shmid(), buffer.struct_shmid());
    if agent.reply(from, &reply) {
        agent.buffer_exported();
    }
}

/// Reply the configured subbuffer count for the channel.
pub(crate) fn get_n_subbufs(agent: &Agent, target: &ChannelCpu, from: &UnixAddr) {
    debug!(target = %target, "get_n_subbufs");

    match find_channel(agent, target) {
        Ok(channel) => {
            agent.reply(from, &channel.n_subbufs().to_string());
        }
        Err(e) => warn!(target = %target, error = %e, "get_n_subbufs failed"),
    }
}

/// Reply the configured subbuffer byte size for the channel.
pub(crate) fn get_subbuf_size(agent: &Agent, target: &ChannelCpu, from: &UnixAddr) {
    debug!(target = %target, "get_subbuf_size");

    match find_channel(agent, target) {
        Ok(channel) => {
            agent.reply(from, &channel.subbuf_size().to_string());
        }
        Err(e) => warn!(target = %target, error = %e, "get_subbuf_size failed"),
    }
}

/// Register the request with the blocked-consumer registry. No inline
/// reply even when data is already available: every `get_subbuffer`
/// resolves through the poll sweep, so each request sees exactly one
/// reply per pass regardless of timing.
pub(crate) fn get_subbuffer(agent: &Agent, target: &ChannelCpu, from: &UnixAddr) {
    debug!(target = %target, "get_subbuffer");

    let buffer = match find_buffer(agent, target) {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!(target = %target, error = %e, "get_subbuffer failed");
            return;
        }
    };

    let producer_fd = match buffer.data_ready_fd().try_clone_to_owned() {
        Ok(fd) => fd,
        Err(e) => {
            warn!(target = %target, error = %e, "cannot duplicate data-ready handle");
            return;
        }
    };

    agent
        .blocked
        .lock()
        .push(PendingConsumerRequest::new(producer_fd, *from, buffer));
}

/// Release a claimed subbuffer. Replies `"OK"` when the release went
/// through and `"ERROR"` when it did not; either way the session
/// continues.
pub(crate) fn put_subbuffer(agent: &Agent, target: &ChannelCpu, consumed_old: u64, from: &UnixAddr) {
    debug!(target = %target, consumed_old, "put_subbuffer");

    let buffer = match find_buffer(agent, target) {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!(target = %target, error = %e, "put_subbuffer failed");
            return;
        }
    };

    let reply = match buffer.put_subbuf(consumed_old) {
        Ok(consumed_new) => {
            debug!(target = %target, consumed_new, "subbuffer released");
            "OK"
        }
        Err(e) => {
            warn!(target = %target, error = %e, "subbuffer release failed");
            "ERROR"
        }
    };
    agent.reply(from, reply);
}
