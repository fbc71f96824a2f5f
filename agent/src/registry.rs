use std::sync::Arc;

use shmbuf::{Channel, ChannelConfig};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("trace \"{0}\" not found")]
    NotFound(String),

    #[error("trace \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("trace \"{0}\" is already allocated")]
    AlreadyAllocated(String),

    #[error("trace \"{0}\" is not allocated")]
    NotAllocated(String),

    #[error("allocating channel \"{channel}\" for trace \"{name}\": {source}")]
    ChannelAlloc {
        name: String,
        channel: String,
        source: shmbuf::ShmBufError,
    },
}

/// One named trace: a type tag, an activity flag, and (once allocated)
/// the set of channels whose buffers carry its events.
pub struct Trace {
    name: String,
    trace_type: String,
    channels: Vec<Arc<Channel>>,
    allocated: bool,
    active: bool,
}

impl Trace {
    fn new(name: &str) -> Self {
        Trace {
            name: name.to_string(),
            trace_type: String::new(),
            channels: Vec::new(),
            allocated: false,
            active: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace_type(&self) -> &str {
        &self.trace_type
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.name() == name)
    }
}

/// All traces of the process, plus the channel set the next allocation
/// will instantiate. Held behind the agent's registry lock; lookups and
/// mutations happen under that lock for their whole duration.
pub struct TraceRegistry {
    traces: Vec<Trace>,
    channel_set: Vec<(String, ChannelConfig)>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        TraceRegistry {
            traces: Vec::new(),
            channel_set: Vec::new(),
        }
    }

    /// Make a channel name (and its buffer geometry) part of every trace
    /// allocated from now on. Registering the same name again is a no-op.
    pub fn register_channel(&mut self, name: &str, config: ChannelConfig) {
        if self.channel_set.iter().any(|(n, _)| n == name) {
            return;
        }
        debug!(channel = name, "channel registered");
        self.channel_set.push((name.to_string(), config));
    }

    pub fn find(&self, name: &str) -> Option<&Trace> {
        self.traces.iter().find(|t| t.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Result<&mut Trace, TraceError> {
        self.traces
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| TraceError::NotFound(name.to_string()))
    }

    pub fn setup(&mut self, name: &str) -> Result<(), TraceError> {
        if self.find(name).is_some() {
            return Err(TraceError::AlreadyExists(name.to_string()));
        }
        debug!(trace = name, "trace set up");
        self.traces.push(Trace::new(name));
        Ok(())
    }

    pub fn set_type(&mut self, name: &str, trace_type: &str) -> Result<(), TraceError> {
        let trace = self.find_mut(name)?;
        trace.trace_type = trace_type.to_string();
        Ok(())
    }

    /// Instantiate the registered channel set for a trace, creating the
    /// per-CPU shared-memory buffers.
    pub fn alloc(&mut self, name: &str) -> Result<(), TraceError> {
        let channel_set = self.channel_set.clone();
        let trace = self.find_mut(name)?;
        if trace.allocated {
            return Err(TraceError::AlreadyAllocated(name.to_string()));
        }

        let mut channels = Vec::with_capacity(channel_set.len());
        for (channel_name, config) in channel_set {
            let channel =
                Channel::new(&channel_name, config).map_err(|source| TraceError::ChannelAlloc {
                    name: name.to_string(),
                    channel: channel_name.clone(),
                    source,
                })?;
            channels.push(Arc::new(channel));
        }

        trace.channels = channels;
        trace.allocated = true;
        debug!(trace = name, channels = trace.channels.len(), "trace allocated");
        Ok(())
    }

    pub fn start(&mut self, name: &str) -> Result<(), TraceError> {
        let trace = self.find_mut(name)?;
        if !trace.allocated {
            return Err(TraceError::NotAllocated(name.to_string()));
        }
        trace.active = true;
        debug!(trace = name, "trace started");
        Ok(())
    }

    pub fn stop(&mut self, name: &str) -> Result<(), TraceError> {
        let trace = self.find_mut(name)?;
        trace.active = false;
        debug!(trace = name, "trace stopped");
        Ok(())
    }

    /// Tear a trace down: shut the producer side of every channel so
    /// waiting consumers observe end-of-data, then drop the trace. Buffers
    /// stay alive for as long as pending requests hold them.
    pub fn destroy(&mut self, name: &str) -> Result<(), TraceError> {
        let index = self
            .traces
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| TraceError::NotFound(name.to_string()))?;

        let trace = self.traces.remove(index);
        for channel in &trace.channels {
            channel.shutdown();
        }
        debug!(trace = %trace.name, "trace destroyed");
        Ok(())
    }

    /// Whether any trace is currently recording.
    pub fn recording(&self) -> bool {
        self.traces.iter().any(|t| t.active)
    }
}

impl Default for TraceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn small_config(n_cpus: usize) -> ChannelConfig {
        ChannelConfig {
            subbuf_size: 128,
            n_subbufs: 2,
            n_cpus,
        }
    }

    #[fixture]
    fn registry() -> TraceRegistry {
        let mut registry = TraceRegistry::new();
        registry.register_channel("events", small_config(2));
        registry
    }

    #[rstest]
    fn test_full_lifecycle(mut registry: TraceRegistry) {
        registry.setup("auto").unwrap();
        registry.set_type("auto", "relay").unwrap();
        registry.alloc("auto").unwrap();

        let trace = registry.find("auto").unwrap();
        assert_eq!(trace.trace_type(), "relay");
        assert!(!trace.active());
        assert_eq!(trace.channels().len(), 1);
        assert_eq!(trace.channel("events").unwrap().n_cpus(), 2);

        registry.start("auto").unwrap();
        assert!(registry.recording());

        registry.stop("auto").unwrap();
        assert!(!registry.recording());

        registry.destroy("auto").unwrap();
        assert!(registry.find("auto").is_none());
    }

    #[rstest]
    fn test_double_setup_rejected(mut registry: TraceRegistry) {
        registry.setup("auto").unwrap();
        assert!(matches!(
            registry.setup("auto"),
            Err(TraceError::AlreadyExists(_))
        ));
    }

    #[rstest]
    fn test_start_requires_allocation(mut registry: TraceRegistry) {
        registry.setup("auto").unwrap();
        assert!(matches!(
            registry.start("auto"),
            Err(TraceError::NotAllocated(_))
        ));
    }

    #[rstest]
    fn test_double_alloc_rejected(mut registry: TraceRegistry) {
        registry.setup("auto").unwrap();
        registry.alloc("auto").unwrap();
        assert!(matches!(
            registry.alloc("auto"),
            Err(TraceError::AlreadyAllocated(_))
        ));
    }

    #[rstest]
    fn test_unknown_trace_rejected(mut registry: TraceRegistry) {
        assert!(matches!(
            registry.alloc("nosuch"),
            Err(TraceError::NotFound(_))
        ));
        assert!(matches!(
            registry.stop("nosuch"),
            Err(TraceError::NotFound(_))
        ));
        assert!(matches!(
            registry.destroy("nosuch"),
            Err(TraceError::NotFound(_))
        ));
    }

    #[rstest]
    fn test_register_channel_deduplicates(mut registry: TraceRegistry) {
        registry.register_channel("events", small_config(1));
        registry.register_channel("metadata", small_config(1));

        registry.setup("auto").unwrap();
        registry.alloc("auto").unwrap();

        let trace = registry.find("auto").unwrap();
        assert_eq!(trace.channels().len(), 2);
        // the first registration's geometry wins
        assert_eq!(trace.channel("events").unwrap().n_cpus(), 2);
    }

    #[rstest]
    fn test_destroy_shuts_channels_down(mut registry: TraceRegistry) {
        registry.setup("auto").unwrap();
        registry.alloc("auto").unwrap();

        let buffer = {
            let trace = registry.find("auto").unwrap();
            trace.channel("events").unwrap().buffer(0).unwrap().clone()
        };

        registry.destroy("auto").unwrap();

        use std::os::fd::AsRawFd;
        let mut byte = [0u8; 1];
        let n = nix::unistd::read(buffer.data_ready_fd().as_raw_fd(), &mut byte).unwrap();
        assert_eq!(n, 0);
    }
}
