use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmBufError {
    #[error("subbuffer size must be a power of two, got {0}")]
    SizeNotPowerOfTwo(usize),

    #[error("subbuffer count must be a power of two, got {0}")]
    CountNotPowerOfTwo(usize),

    #[error("shared memory operation failed: {0}")]
    ShmFailed(nix::errno::Errno),

    #[error("pipe operation failed: {0}")]
    PipeFailed(#[from] nix::errno::Errno),

    #[error("no subbuffer ready")]
    NoData,

    #[error("subbuffer already claimed")]
    Busy,

    #[error("stale consumed offset token: expected {expected}, got {got}")]
    StaleToken { expected: u64, got: u64 },

    #[error("cpu {cpu} out of range, channel has {n_cpus} buffers")]
    CpuOutOfRange { cpu: usize, n_cpus: usize },

    #[error("record of {size} bytes exceeds subbuffer size {subbuf_size}")]
    RecordTooLarge { size: usize, subbuf_size: usize },

    #[error("ring full, all subbuffers awaiting consumption")]
    RingFull,
}
