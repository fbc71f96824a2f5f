use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::UnixAddr;
use protocol::Command;
use tracing::{debug, error, warn};

use crate::handoff;
use crate::lifecycle::Agent;
use crate::Result;

/// Receive timeout of one loop iteration; also the cadence at which
/// blocked consumers are serviced.
const RECV_TIMEOUT: Duration = Duration::from_millis(5);

/// The dispatcher loop, run on the dedicated listener thread. Every
/// iteration services the blocked consumers (zero-timeout sweep), then
/// blocks up to `RECV_TIMEOUT` for one command and dispatches it.
///
/// Unknown or malformed input never ends the loop. An error return means
/// the trace infrastructure failed underneath a create-like verb and the
/// thread is done for; the process itself keeps running untraced.
pub(crate) fn listener_main(agent: Arc<Agent>) -> Result<()> {
    debug!("listener running");

    loop {
        agent.service_blocked();

        let Some(transport) = agent.transport.load_full() else {
            debug!("control channel released, listener exiting");
            return Ok(());
        };

        let (text, from) = match transport.recv_timeout(RECV_TIMEOUT) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "error receiving command");
                continue;
            }
        };
        drop(transport);

        debug!(command = %text, "received command");
        let command = match Command::parse(&text) {
            Ok(command) => command,
            Err(e) => {
                warn!(input = %text, error = %e, "unable to parse message");
                continue;
            }
        };

        dispatch(&agent, command, &from)?;
    }
}

fn dispatch(agent: &Arc<Agent>, command: Command, from: &UnixAddr) -> Result<()> {
    match command {
        // start sets the trace up, allocates it and starts it; setup or
        // allocation failing means the infrastructure is broken
        Command::Start => {
            agent.create_trace()?;
            if let Err(e) = agent.start_trace() {
                error!(error = %e, "trace start failed");
            }
        }
        Command::TraceSetup => agent.setup_trace()?,
        Command::TraceAlloc => agent.alloc_trace()?,
        Command::TraceCreate => agent.create_trace()?,
        Command::TraceStart => {
            if let Err(e) = agent.start_trace() {
                error!(error = %e, "trace start failed");
            }
        }
        Command::TraceStop => {
            if let Err(e) = agent.stop_trace() {
                error!(error = %e, "trace stop failed");
            }
        }
        Command::TraceDestroy => {
            if let Err(e) = agent.destroy_trace() {
                error!(error = %e, "trace destroy failed");
            }
        }
        Command::ListMarkers => {
            let dump = agent.markers.lock().dump();
            agent.reply(from, &dump);
        }
        Command::PrintMarkers => {
            eprint!("{}", agent.markers.lock().dump());
        }
        Command::GetPidUnique => {
            agent.reply(from, &agent.pid_unique().to_string());
        }
        Command::EnableMarker(path) => {
            if let Err(e) = agent.markers.lock().connect(&path.channel, &path.name) {
                warn!(marker = %path, error = %e, "could not enable marker");
            }
        }
        Command::DisableMarker(path) => {
            if let Err(e) = agent.markers.lock().disconnect(&path.channel, &path.name) {
                warn!(marker = %path, error = %e, "could not disable marker");
            }
        }
        Command::GetShmid(target) => handoff::get_shmid(agent, &target, from),
        Command::GetNSubbufs(target) => handoff::get_n_subbufs(agent, &target, from),
        Command::GetSubbufSize(target) => handoff::get_subbuf_size(agent, &target, from),
        Command::GetSubbuffer(target) => handoff::get_subbuffer(agent, &target, from),
        Command::PutSubbuffer {
            target,
            consumed_old,
        } => handoff::put_subbuffer(agent, &target, consumed_old, from),
    }

    Ok(())
}
