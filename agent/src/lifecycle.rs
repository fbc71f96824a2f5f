use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::sys::socket::UnixAddr;
use parking_lot::Mutex;
use shmbuf::ChannelConfig;
use tracing::{debug, error, warn};

use crate::blocked::BlockedConsumers;
use crate::config::{AgentConfig, AutoProbe};
use crate::handoff::{TRACE_NAME, TRACE_TYPE};
use crate::listener::listener_main;
use crate::markers::MarkerRegistry;
use crate::registry::TraceRegistry;
use crate::transport::Transport;
use crate::Result;

const EXIT_WAIT_INTERVAL: Duration = Duration::from_millis(200);
const EXIT_WAIT_MAX: Duration = Duration::from_secs(3);

/// Channels every process carries, so a trace can be allocated before any
/// instrumentation has registered its own.
const DEFAULT_CHANNELS: &[&str] = &["events", "metadata"];

/// The process-lifetime agent context: identity, counters, flags and the
/// shared registries, handed as one `Arc` to every component. Fields that
/// fork or signal delivery may touch are atomics; everything else sits
/// behind its own lock.
pub struct Agent {
    config: AgentConfig,
    pid_unique: AtomicI64,
    pub(crate) buffers_to_export: AtomicU64,
    listener_active: AtomicBool,
    pub(crate) transport: ArcSwapOption<Transport>,
    pub(crate) registry: Mutex<TraceRegistry>,
    pub(crate) markers: Mutex<MarkerRegistry>,
    pub(crate) blocked: Mutex<BlockedConsumers>,
}

/// A process identity that survives pid reuse: seconds in the high word,
/// microseconds below.
fn make_pid_unique() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ((now.as_secs() as i64) << 32) | now.subsec_micros() as i64
}

impl Agent {
    /// Build the context and bind the control socket, without starting
    /// the listener or any eager behavior.
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        let transport = Transport::bind(&config.sock_dir, std::process::id())?;

        let agent = Arc::new(Agent {
            config,
            pid_unique: AtomicI64::new(make_pid_unique()),
            buffers_to_export: AtomicU64::new(0),
            listener_active: AtomicBool::new(false),
            transport: ArcSwapOption::from_pointee(transport),
            registry: Mutex::new(TraceRegistry::new()),
            markers: Mutex::new(MarkerRegistry::new()),
            blocked: Mutex::new(BlockedConsumers::new()),
        });

        {
            let mut registry = agent.registry.lock();
            for name in DEFAULT_CHANNELS {
                registry.register_channel(name, ChannelConfig::default());
            }
        }

        Ok(agent)
    }

    /// Process-start entry point: build the context, start the listener
    /// thread and apply the configured eager behaviors. Must run before
    /// any instrumentation can fire.
    pub fn initialize(config: AgentConfig) -> Result<Arc<Self>> {
        let auto_probe = config.auto_probe.clone();
        let auto_trace = config.auto_trace;

        let agent = Self::new(config)?;
        agent.spawn_listener();

        if !matches!(auto_probe, AutoProbe::Disabled) {
            agent.markers.lock().set_auto_probe(auto_probe);
        }

        if auto_trace {
            debug!("starting early tracing");
            agent.setup_trace()?;
            agent.alloc_trace()?;
            agent.start_trace()?;
            // announce only once the trace is running, to avoid confusing
            // the daemon if the start fails
            agent.announce_channels();
        }

        Ok(agent)
    }

    pub fn pid_unique(&self) -> i64 {
        self.pid_unique.load(Ordering::Relaxed)
    }

    /// Buffers announced to the consumer daemon whose shared-memory ids
    /// have not been handed off yet.
    pub fn buffers_to_export(&self) -> u64 {
        self.buffers_to_export.load(Ordering::Relaxed)
    }

    pub(crate) fn buffer_exported(&self) {
        let _ = self
            .buffers_to_export
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    /// Declare an instrumentation point, making its channel part of the
    /// next trace allocation.
    pub fn register_marker(&self, channel: &str, name: &str, format: &str) {
        self.markers.lock().register(channel, name, format);
        self.registry
            .lock()
            .register_channel(channel, ChannelConfig::default());
    }

    /// Declare a channel with explicit buffer geometry ahead of the next
    /// trace allocation.
    pub fn register_channel(&self, name: &str, config: ChannelConfig) {
        self.registry.lock().register_channel(name, config);
    }

    /// Fire-and-forget event write from an instrumentation call site,
    /// routed to the current CPU's ring of the named channel.
    pub fn submit(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let registry = self.registry.lock();
        let trace = registry.find(TRACE_NAME).ok_or(crate::AgentError::NotRecording)?;
        if !trace.active() {
            return Err(crate::AgentError::NotRecording);
        }
        let channel = trace
            .channel(channel)
            .ok_or_else(|| crate::AgentError::UnknownChannel(channel.to_string()))?;

        let current = unsafe { libc::sched_getcpu() };
        let cpu = if current < 0 {
            0
        } else {
            current as usize % channel.n_cpus()
        };

        channel.buffer(cpu)?.write_event(payload)?;
        Ok(())
    }

    pub(crate) fn spawn_listener(self: &Arc<Self>) {
        if self.listener_active.swap(true, Ordering::SeqCst) {
            warn!("not creating listener, one is already running");
            return;
        }

        let agent = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("trace-listener".to_string())
            .spawn(move || match listener_main(agent) {
                Ok(()) => debug!("listener stopped"),
                Err(e) => error!(error = %e, "listener terminated"),
            });

        if let Err(e) = spawned {
            self.listener_active.store(false, Ordering::SeqCst);
            error!(error = %e, "cannot spawn listener thread");
        }
    }

    pub(crate) fn reply(&self, to: &UnixAddr, text: &str) -> bool {
        let Some(transport) = self.transport.load_full() else {
            warn!("cannot reply, control channel released");
            return false;
        };
        match transport.reply(to, text) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "sending reply failed");
                false
            }
        }
    }

    pub(crate) fn service_blocked(&self) {
        if let Some(transport) = self.transport.load_full() {
            self.blocked.lock().service(&transport);
        }
    }

    pub(crate) fn setup_trace(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.setup(TRACE_NAME)?;
        registry.set_type(TRACE_NAME, TRACE_TYPE)?;
        Ok(())
    }

    pub(crate) fn alloc_trace(&self) -> Result<()> {
        Ok(self.registry.lock().alloc(TRACE_NAME)?)
    }

    pub(crate) fn create_trace(&self) -> Result<()> {
        self.setup_trace()?;
        self.alloc_trace()?;
        self.announce_channels();
        Ok(())
    }

    pub(crate) fn start_trace(&self) -> Result<()> {
        Ok(self.registry.lock().start(TRACE_NAME)?)
    }

    pub(crate) fn stop_trace(&self) -> Result<()> {
        Ok(self.registry.lock().stop(TRACE_NAME)?)
    }

    pub(crate) fn destroy_trace(&self) -> Result<()> {
        Ok(self.registry.lock().destroy(TRACE_NAME)?)
    }

    /// Ask the daemon to collect every channel×cpu buffer of the default
    /// trace. Each announced buffer raises the export counter whether or
    /// not the daemon could be reached.
    pub(crate) fn announce_channels(&self) {
        let Some(transport) = self.transport.load_full() else {
            return;
        };
        let registry = self.registry.lock();
        let Some(trace) = registry.find(TRACE_NAME) else {
            warn!(trace = TRACE_NAME, "cannot announce channels, trace not found");
            return;
        };

        let pid = std::process::id();
        for channel in trace.channels() {
            for (cpu, _) in channel.buffers() {
                let name = format!("{}_{}", channel.name(), cpu);
                if let Err(e) = transport.notify_daemon(&format!("collect {} {}", pid, name)) {
                    warn!(buffer = %name, error = %e, "collection request failed, is the daemon running?");
                }
                self.buffers_to_export.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Mask every signal before forking, so no instrumentation fires in
    /// the child until it has been resanitized.
    pub fn before_fork() -> ForkGuard {
        let mut previous = SigSet::empty();
        if let Err(e) = sigprocmask(
            SigmaskHow::SIG_BLOCK,
            Some(&SigSet::all()),
            Some(&mut previous),
        ) {
            warn!(error = %e, "cannot mask signals before fork");
        }
        ForkGuard { previous }
    }

    pub fn after_fork_parent(&self, guard: ForkGuard) {
        restore_signals(guard);
    }

    /// Resanitize the child's copy of the agent. Must run before any
    /// traced event can be produced in the child; the caller keeps
    /// signals masked from before the fork until this returns.
    pub fn after_fork_child(self: &Arc<Self>, guard: ForkGuard) {
        debug!("resanitizing after fork");
        self.pid_unique.store(make_pid_unique(), Ordering::Relaxed);

        // the parent's trace must not be considered alive in the child
        if let Err(e) = self.stop_trace() {
            debug!(error = %e, "stopping inherited trace");
        }
        if let Err(e) = self.destroy_trace() {
            debug!(error = %e, "destroying inherited trace");
        }

        // close the inherited control socket before anything can reply
        // through it, then drop the parent's waiting consumers
        self.transport.store(None);
        self.blocked.lock().clear();
        self.listener_active.store(false, Ordering::SeqCst);

        match Transport::bind(&self.config.sock_dir, std::process::id()) {
            Ok(transport) => self.transport.store(Some(Arc::new(transport))),
            Err(e) => {
                error!(error = %e, "cannot rebind control socket in fork child");
            }
        }

        self.spawn_listener();

        if let Err(e) = self.setup_trace().and_then(|()| self.alloc_trace()) {
            error!(error = %e, "cannot recreate trace in fork child");
        } else {
            if let Err(e) = self.start_trace() {
                error!(error = %e, "cannot restart trace in fork child");
            }
            self.announce_channels();
        }

        restore_signals(guard);
    }

    /// Process-exit entry point. If recording is active and buffers were
    /// announced but never handed off, wait a bounded while for the
    /// daemon to fetch them; then stop and destroy the default trace and
    /// release the control channel. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.registry.lock().recording() && self.buffers_to_export() > 0 {
            debug!("keeping process alive for the consumer daemon");
            let mut waited = Duration::ZERO;
            while self.buffers_to_export() > 0 {
                thread::sleep(EXIT_WAIT_INTERVAL);
                waited += EXIT_WAIT_INTERVAL;
                if waited >= EXIT_WAIT_MAX {
                    warn!("non-consumed buffers remaining after wait limit, not waiting anymore");
                    break;
                }
            }
        }

        if let Err(e) = self.stop_trace() {
            debug!(error = %e, "stopping trace at exit");
        }
        if let Err(e) = self.destroy_trace() {
            debug!(error = %e, "destroying trace at exit");
        }
        self.transport.store(None);
    }
}

/// The signal mask held across a fork, restored by the matching
/// `after_fork_*` call.
pub struct ForkGuard {
    previous: SigSet,
}

fn restore_signals(guard: ForkGuard) {
    if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&guard.previous), None) {
        warn!(error = %e, "cannot restore signal mask");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocked::PendingConsumerRequest;
    use rstest::*;
    use std::time::Instant;
    use tempfile::TempDir;

    #[fixture]
    fn dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn quiet_config(dir: &TempDir) -> AgentConfig {
        AgentConfig::with_sock_dir(dir.path())
    }

    #[rstest]
    fn test_initialize_binds_control_socket(dir: TempDir) {
        let _agent = Agent::initialize(quiet_config(&dir)).unwrap();
        let sock = dir.path().join(std::process::id().to_string());
        assert!(sock.exists());
    }

    #[rstest]
    fn test_pid_unique_carries_seconds_in_high_word(dir: TempDir) {
        let agent = Agent::new(quiet_config(&dir)).unwrap();
        assert!(agent.pid_unique() >> 32 > 0);
    }

    #[rstest]
    fn test_shutdown_without_trace_is_immediate(dir: TempDir) {
        let agent = Agent::new(quiet_config(&dir)).unwrap();
        agent.buffers_to_export.store(5, Ordering::Relaxed);

        let started = Instant::now();
        agent.shutdown();

        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(agent.transport.load_full().is_none());

        // calling it again stays immediate
        let started = Instant::now();
        agent.shutdown();
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[rstest]
    fn test_shutdown_with_drained_counter_is_immediate(dir: TempDir) {
        let agent = Agent::new(quiet_config(&dir)).unwrap();
        agent.setup_trace().unwrap();
        agent.alloc_trace().unwrap();
        agent.start_trace().unwrap();

        let started = Instant::now();
        agent.shutdown();
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(!agent.registry.lock().recording());
    }

    #[rstest]
    fn test_shutdown_waits_for_export_counter(dir: TempDir) {
        let agent = Agent::new(quiet_config(&dir)).unwrap();
        agent.setup_trace().unwrap();
        agent.alloc_trace().unwrap();
        agent.start_trace().unwrap();
        agent.buffers_to_export.store(1, Ordering::Relaxed);

        let drainer = {
            let agent = Arc::clone(&agent);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                agent.buffer_exported();
            })
        };

        let started = Instant::now();
        agent.shutdown();
        let elapsed = started.elapsed();

        drainer.join().unwrap();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < EXIT_WAIT_MAX);
    }

    #[rstest]
    fn test_export_counter_saturates_at_zero(dir: TempDir) {
        let agent = Agent::new(quiet_config(&dir)).unwrap();
        assert_eq!(agent.buffers_to_export(), 0);
        agent.buffer_exported();
        assert_eq!(agent.buffers_to_export(), 0);
    }

    #[rstest]
    fn test_register_marker_registers_channel(dir: TempDir) {
        let agent = Agent::new(quiet_config(&dir)).unwrap();
        agent.register_marker("core", "request_begin", "id %d");

        agent.setup_trace().unwrap();
        agent.alloc_trace().unwrap();

        let registry = agent.registry.lock();
        let trace = registry.find(TRACE_NAME).unwrap();
        assert!(trace.channel("core").is_some());
        assert!(trace.channel("events").is_some());
    }

    #[rstest]
    fn test_submit_requires_active_trace(dir: TempDir) {
        let agent = Agent::new(quiet_config(&dir)).unwrap();
        assert!(matches!(
            agent.submit("events", b"payload"),
            Err(crate::AgentError::NotRecording)
        ));

        agent.setup_trace().unwrap();
        agent.alloc_trace().unwrap();
        agent.start_trace().unwrap();

        agent.submit("events", b"payload").unwrap();
        assert!(matches!(
            agent.submit("nochan", b"payload"),
            Err(crate::AgentError::UnknownChannel(_))
        ));
    }

    #[rstest]
    fn test_fork_child_resanitizes(dir: TempDir) {
        let mut config = quiet_config(&dir);
        config.auto_trace = true;
        let agent = Agent::initialize(config).unwrap();
        assert!(agent.registry.lock().recording());

        // a consumer left waiting in the parent
        {
            let buffer = {
                let registry = agent.registry.lock();
                let trace = registry.find(TRACE_NAME).unwrap();
                trace.channel("events").unwrap().buffer(0).unwrap().clone()
            };
            let fd = buffer.data_ready_fd().try_clone_to_owned().unwrap();
            let addr = UnixAddr::new(&dir.path().join("consumer")).unwrap();
            agent
                .blocked
                .lock()
                .push(PendingConsumerRequest::new(fd, addr, buffer));
        }
        assert_eq!(agent.blocked.lock().len(), 1);

        let guard = Agent::before_fork();
        agent.after_fork_child(guard);

        assert!(agent.blocked.lock().is_empty());
        assert!(agent.transport.load_full().is_some());
        assert!(agent.listener_active.load(Ordering::SeqCst));
        assert!(agent.registry.lock().recording());

        agent.stop_trace().unwrap();
    }
}
