use thiserror::Error;

pub mod blocked;
pub mod client;
pub mod config;
pub mod handoff;
pub mod lifecycle;
pub mod listener;
pub mod markers;
pub mod registry;
pub mod transport;

pub use client::ConsumerClient;
pub use config::{AgentConfig, AutoProbe};
pub use lifecycle::{Agent, ForkGuard};
pub use transport::Transport;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system error: {0}")]
    Nix(#[from] nix::Error),
    #[error("buffer error: {0}")]
    Buffer(#[from] shmbuf::ShmBufError),
    #[error("command error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
    #[error("trace error: {0}")]
    Trace(#[from] registry::TraceError),
    #[error("marker error: {0}")]
    Marker(#[from] markers::MarkerError),
    #[error("no active trace to submit into")]
    NotRecording,
    #[error("unknown channel \"{0}\"")]
    UnknownChannel(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
