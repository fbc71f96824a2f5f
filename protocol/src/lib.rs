//! Plain-text command grammar shared by the in-process agent and the
//! consumer daemon.
//!
//! Commands are single datagrams of space-separated tokens, e.g.
//! `get_subbuf_size mychannel_3` or `put_subbuffer mychannel_3 8192`.
//! Buffer-addressed verbs name their target as `<channel>_<cpu>`, split on
//! the last underscore. Replies are plain text as well (`"OK"`,
//! `"OK <token>"`, `"ERROR"`, `"END"`, or a decimal value).

use thiserror::Error;

/// Upper bound on a single command datagram; receive buffers are sized to
/// this instead of allocating per message.
pub const MAX_MESSAGE_LEN: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0}: missing argument")]
    MissingArgument(&'static str),
    #[error("cannot parse channel/cpu pair: {0}")]
    BadChannelCpu(String),
    #[error("invalid consumed offset token: {0}")]
    BadToken(String),
    #[error("invalid marker path: {0}")]
    BadMarkerPath(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A buffer address on the wire: channel name plus per-CPU index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCpu {
    pub channel: String,
    pub cpu: usize,
}

impl ChannelCpu {
    pub fn parse(token: &str) -> Result<Self> {
        match split_channel_cpu(token) {
            (channel, Some(cpu)) => Ok(ChannelCpu {
                channel: channel.to_string(),
                cpu,
            }),
            (_, None) => Err(ProtocolError::BadChannelCpu(token.to_string())),
        }
    }
}

impl std::fmt::Display for ChannelCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.channel, self.cpu)
    }
}

/// Split `<channel>_<cpu>` on the last underscore.
///
/// The cpu is `None` when the token has no underscore or the suffix is not
/// a non-negative integer; the channel part is the full token in the
/// no-underscore case.
pub fn split_channel_cpu(token: &str) -> (&str, Option<usize>) {
    match token.rsplit_once('_') {
        Some((channel, suffix)) => (channel, suffix.parse::<usize>().ok()),
        None => (token, None),
    }
}

/// An instrumentation point address: `<channel>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPath {
    pub channel: String,
    pub name: String,
}

impl MarkerPath {
    pub fn parse(token: &str) -> Result<Self> {
        match token.split_once('/') {
            Some((channel, name)) if !channel.is_empty() && !name.is_empty() => Ok(MarkerPath {
                channel: channel.to_string(),
                name: name.to_string(),
            }),
            _ => Err(ProtocolError::BadMarkerPath(token.to_string())),
        }
    }
}

impl std::fmt::Display for MarkerPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    TraceSetup,
    TraceAlloc,
    TraceCreate,
    TraceStart,
    TraceStop,
    TraceDestroy,
    ListMarkers,
    PrintMarkers,
    GetPidUnique,
    EnableMarker(MarkerPath),
    DisableMarker(MarkerPath),
    GetShmid(ChannelCpu),
    GetNSubbufs(ChannelCpu),
    GetSubbufSize(ChannelCpu),
    GetSubbuffer(ChannelCpu),
    PutSubbuffer {
        target: ChannelCpu,
        consumed_old: u64,
    },
}

impl Command {
    pub fn parse(input: &str) -> Result<Self> {
        let mut tokens = input.split_ascii_whitespace();
        let verb = tokens.next().ok_or(ProtocolError::Empty)?;

        let command = match verb {
            "start" => Command::Start,
            "trace_setup" => Command::TraceSetup,
            "trace_alloc" => Command::TraceAlloc,
            "trace_create" => Command::TraceCreate,
            "trace_start" => Command::TraceStart,
            "trace_stop" => Command::TraceStop,
            "trace_destroy" => Command::TraceDestroy,
            "list_markers" => Command::ListMarkers,
            "print_markers" => Command::PrintMarkers,
            "get_pidunique" => Command::GetPidUnique,
            "enable_marker" => Command::EnableMarker(marker_arg("enable_marker", &mut tokens)?),
            "disable_marker" => Command::DisableMarker(marker_arg("disable_marker", &mut tokens)?),
            "get_shmid" => Command::GetShmid(channel_arg("get_shmid", &mut tokens)?),
            "get_n_subbufs" => Command::GetNSubbufs(channel_arg("get_n_subbufs", &mut tokens)?),
            "get_subbuf_size" => Command::GetSubbufSize(channel_arg("get_subbuf_size", &mut tokens)?),
            "get_subbuffer" => Command::GetSubbuffer(channel_arg("get_subbuffer", &mut tokens)?),
            "put_subbuffer" => {
                let target = channel_arg("put_subbuffer", &mut tokens)?;
                let token = tokens.next().ok_or(ProtocolError::MissingArgument("put_subbuffer"))?;
                let consumed_old = token
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::BadToken(token.to_string()))?;
                Command::PutSubbuffer {
                    target,
                    consumed_old,
                }
            }
            _ => return Err(ProtocolError::UnknownCommand(input.to_string())),
        };

        Ok(command)
    }
}

fn channel_arg<'a>(
    verb: &'static str,
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<ChannelCpu> {
    let token = tokens.next().ok_or(ProtocolError::MissingArgument(verb))?;
    ChannelCpu::parse(token)
}

fn marker_arg<'a>(
    verb: &'static str,
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<MarkerPath> {
    let token = tokens.next().ok_or(ProtocolError::MissingArgument(verb))?;
    MarkerPath::parse(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("mychan_0", "mychan", Some(0))]
    #[case("mychan_12", "mychan", Some(12))]
    #[case("with_underscores_3", "with_underscores", Some(3))]
    #[case("nounderscore", "nounderscore", None)]
    #[case("mychan_x", "mychan", None)]
    #[case("mychan_-1", "mychan", None)]
    #[case("mychan_", "mychan", None)]
    fn test_split_channel_cpu(
        #[case] token: &str,
        #[case] channel: &str,
        #[case] cpu: Option<usize>,
    ) {
        assert_eq!(split_channel_cpu(token), (channel, cpu));
    }

    #[rstest]
    #[case("a", 0)]
    #[case("events", 7)]
    #[case("deep_name", 31)]
    fn test_split_inverts_format(#[case] channel: &str, #[case] cpu: usize) {
        let formatted = format!("{}_{}", channel, cpu);
        assert_eq!(split_channel_cpu(&formatted), (channel, Some(cpu)));
    }

    #[rstest]
    #[case("start", Command::Start)]
    #[case("trace_setup", Command::TraceSetup)]
    #[case("trace_alloc", Command::TraceAlloc)]
    #[case("trace_create", Command::TraceCreate)]
    #[case("trace_start", Command::TraceStart)]
    #[case("trace_stop", Command::TraceStop)]
    #[case("trace_destroy", Command::TraceDestroy)]
    #[case("list_markers", Command::ListMarkers)]
    #[case("print_markers", Command::PrintMarkers)]
    #[case("get_pidunique", Command::GetPidUnique)]
    fn test_parse_bare_verbs(#[case] input: &str, #[case] expected: Command) {
        assert_eq!(Command::parse(input).unwrap(), expected);
    }

    #[rstest]
    fn test_parse_buffer_verbs() {
        let target = ChannelCpu {
            channel: "mychan".to_string(),
            cpu: 3,
        };
        assert_eq!(
            Command::parse("get_shmid mychan_3").unwrap(),
            Command::GetShmid(target.clone())
        );
        assert_eq!(
            Command::parse("get_n_subbufs mychan_3").unwrap(),
            Command::GetNSubbufs(target.clone())
        );
        assert_eq!(
            Command::parse("get_subbuf_size mychan_3").unwrap(),
            Command::GetSubbufSize(target.clone())
        );
        assert_eq!(
            Command::parse("get_subbuffer mychan_3").unwrap(),
            Command::GetSubbuffer(target.clone())
        );
        assert_eq!(
            Command::parse("put_subbuffer mychan_3 57").unwrap(),
            Command::PutSubbuffer {
                target,
                consumed_old: 57
            }
        );
    }

    #[rstest]
    fn test_parse_marker_verbs() {
        assert_eq!(
            Command::parse("enable_marker core/request_begin").unwrap(),
            Command::EnableMarker(MarkerPath {
                channel: "core".to_string(),
                name: "request_begin".to_string(),
            })
        );
        assert!(matches!(
            Command::parse("disable_marker noslash"),
            Err(ProtocolError::BadMarkerPath(_))
        ));
    }

    #[rstest]
    #[case("", ProtocolError::Empty)]
    #[case("frobnicate", ProtocolError::UnknownCommand("frobnicate".to_string()))]
    #[case("get_shmid", ProtocolError::MissingArgument("get_shmid"))]
    #[case(
        "get_subbuffer nounderscore",
        ProtocolError::BadChannelCpu("nounderscore".to_string())
    )]
    #[case(
        "put_subbuffer mychan_1 notanumber",
        ProtocolError::BadToken("notanumber".to_string())
    )]
    #[case("put_subbuffer mychan_1", ProtocolError::MissingArgument("put_subbuffer"))]
    fn test_parse_failures(#[case] input: &str, #[case] expected: ProtocolError) {
        assert_eq!(Command::parse(input).unwrap_err(), expected);
    }

    #[rstest]
    fn test_negative_token_rejected() {
        assert!(matches!(
            Command::parse("put_subbuffer mychan_1 -4"),
            Err(ProtocolError::BadToken(_))
        ));
    }
}
