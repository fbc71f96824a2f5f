use std::sync::Arc;

use crate::buffer::Buffer;
use crate::ShmBufError;

pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub subbuf_size: usize,
    pub n_subbufs: usize,
    pub n_cpus: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            subbuf_size: 4096,
            n_subbufs: 8,
            n_cpus: num_cpus(),
        }
    }
}

/// A named event channel with one subbuffer ring per CPU.
pub struct Channel {
    name: String,
    config: ChannelConfig,
    bufs: Vec<Arc<Buffer>>,
}

impl Channel {
    pub fn new(name: &str, config: ChannelConfig) -> Result<Self, ShmBufError> {
        let mut bufs = Vec::with_capacity(config.n_cpus);
        for _ in 0..config.n_cpus {
            bufs.push(Arc::new(Buffer::new(&config)?));
        }

        Ok(Channel {
            name: name.to_string(),
            config,
            bufs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subbuf_size(&self) -> usize {
        self.config.subbuf_size
    }

    pub fn n_subbufs(&self) -> usize {
        self.config.n_subbufs
    }

    pub fn n_cpus(&self) -> usize {
        self.bufs.len()
    }

    pub fn buffer(&self, cpu: usize) -> Result<&Arc<Buffer>, ShmBufError> {
        self.bufs.get(cpu).ok_or(ShmBufError::CpuOutOfRange {
            cpu,
            n_cpus: self.bufs.len(),
        })
    }

    pub fn buffers(&self) -> impl Iterator<Item = (usize, &Arc<Buffer>)> {
        self.bufs.iter().enumerate()
    }

    /// Close the producer side of every per-CPU ring.
    pub fn shutdown(&self) {
        for buf in &self.bufs {
            buf.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_channel_allocates_per_cpu_rings() {
        let channel = Channel::new(
            "events",
            ChannelConfig {
                subbuf_size: 128,
                n_subbufs: 2,
                n_cpus: 3,
            },
        )
        .unwrap();

        assert_eq!(channel.name(), "events");
        assert_eq!(channel.n_cpus(), 3);
        assert_eq!(channel.subbuf_size(), 128);
        assert_eq!(channel.n_subbufs(), 2);

        let ids: Vec<i32> = channel.buffers().map(|(_, b)| b.shmid()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] != w[1]));
    }

    #[rstest]
    fn test_cpu_out_of_range() {
        let channel = Channel::new(
            "events",
            ChannelConfig {
                subbuf_size: 128,
                n_subbufs: 2,
                n_cpus: 2,
            },
        )
        .unwrap();

        assert!(channel.buffer(1).is_ok());
        assert!(matches!(
            channel.buffer(5),
            Err(ShmBufError::CpuOutOfRange { cpu: 5, n_cpus: 2 })
        ));
    }

    #[rstest]
    fn test_invalid_config_rejected() {
        let bad_size = ChannelConfig {
            subbuf_size: 100,
            n_subbufs: 2,
            n_cpus: 1,
        };
        assert!(matches!(
            Channel::new("events", bad_size),
            Err(ShmBufError::SizeNotPowerOfTwo(100))
        ));

        let bad_count = ChannelConfig {
            subbuf_size: 128,
            n_subbufs: 3,
            n_cpus: 1,
        };
        assert!(matches!(
            Channel::new("events", bad_count),
            Err(ShmBufError::CountNotPowerOfTwo(3))
        ));
    }

    #[rstest]
    fn test_default_config_is_valid() {
        let config = ChannelConfig::default();
        assert!(config.subbuf_size.is_power_of_two());
        assert!(config.n_subbufs.is_power_of_two());
        assert!(config.n_cpus >= 1);
    }
}
