use std::path::PathBuf;

use regex::Regex;
use tracing::warn;

pub const DEFAULT_SOCK_DIR: &str = "/tmp/apptrace";

/// Which instrumentation points get a probe connected automatically at
/// startup (and whenever a new one is registered).
#[derive(Debug, Clone)]
pub enum AutoProbe {
    Disabled,
    All,
    Filter(Regex),
}

impl AutoProbe {
    pub(crate) fn matches(&self, channel: &str, name: &str) -> bool {
        match self {
            AutoProbe::Disabled => false,
            AutoProbe::All => true,
            AutoProbe::Filter(pattern) => pattern.is_match(&format!("{}/{}", channel, name)),
        }
    }
}

/// Agent settings, read once from the environment at process start.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding the per-process control sockets and the consumer
    /// daemon's announcement socket.
    pub sock_dir: PathBuf,
    pub auto_probe: AutoProbe,
    /// Eagerly create, allocate and start the default trace.
    pub auto_trace: bool,
}

impl AgentConfig {
    /// `APPTRACE_AUTOPROBE`: unset disables auto-probing, a value starting
    /// with `/` is a pattern matched against `<channel>/<name>`, anything
    /// else enables every instrumentation point. `APPTRACE_TRACE`: set to
    /// start the default trace eagerly. `APPTRACE_SOCK_DIR`: socket
    /// directory override.
    pub fn from_env() -> Self {
        let sock_dir = std::env::var_os("APPTRACE_SOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCK_DIR));

        let auto_probe = match std::env::var("APPTRACE_AUTOPROBE") {
            Ok(value) => match value.strip_prefix('/') {
                Some(pattern) => match Regex::new(pattern) {
                    Ok(filter) => AutoProbe::Filter(filter),
                    Err(e) => {
                        warn!(pattern, error = %e, "cannot parse auto-probe pattern, ignoring");
                        AutoProbe::Disabled
                    }
                },
                None => AutoProbe::All,
            },
            Err(_) => AutoProbe::Disabled,
        };

        let auto_trace = std::env::var_os("APPTRACE_TRACE").is_some();

        AgentConfig {
            sock_dir,
            auto_probe,
            auto_trace,
        }
    }

    /// Quiet configuration rooted at a chosen socket directory.
    pub fn with_sock_dir(dir: impl Into<PathBuf>) -> Self {
        AgentConfig {
            sock_dir: dir.into(),
            auto_probe: AutoProbe::Disabled,
            auto_trace: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(AutoProbe::Disabled, "core", "request", false)]
    #[case(AutoProbe::All, "core", "request", true)]
    fn test_auto_probe_fixed_modes(
        #[case] mode: AutoProbe,
        #[case] channel: &str,
        #[case] name: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(mode.matches(channel, name), expected);
    }

    #[rstest]
    fn test_auto_probe_filter_matches_full_path() {
        let filter = AutoProbe::Filter(Regex::new("^core/").unwrap());

        assert!(filter.matches("core", "request_begin"));
        assert!(!filter.matches("io", "request_begin"));
        assert!(!filter.matches("corex", "anything"));
    }
}
