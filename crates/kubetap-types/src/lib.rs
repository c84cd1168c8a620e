//! Shared types for kubetap
//!
//! This crate contains data structures used across multiple kubetap crates:
//! endpoint identities, port pairs, tagged output records, the shared
//! stop handle and the error taxonomy.

use chrono::{DateTime, Utc};
use crossterm::style::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Kind of workload an endpoint points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Pod,
    Service,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod => f.write_str("pod"),
            Self::Service => f.write_str("service"),
        }
    }
}

/// A resolved pod or service, unique within one cluster snapshot
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub namespace: String,
    pub name: String,
    pub kind: EndpointKind,
}

impl EndpointIdentity {
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: EndpointKind::Pod,
        }
    }

    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: EndpointKind::Service,
        }
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod information as seen by the resolver
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub status: PodStatus,
    pub containers: Vec<ContainerInfo>,
    pub labels: Vec<(String, String)>,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            status: PodStatus::Unknown,
            containers: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Identity of this pod
    pub fn identity(&self) -> EndpointIdentity {
        EndpointIdentity::pod(self.namespace.clone(), self.name.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodStatus {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub name: String,
    /// Declared container ports as (name, number)
    pub ports: Vec<(Option<String>, u16)>,
    pub restart_count: i32,
}

impl ContainerInfo {
    pub fn new(name: String) -> Self {
        Self {
            name,
            ports: Vec::new(),
            restart_count: 0,
        }
    }
}

// ============================================================================
// Tunnel Types
// ============================================================================

/// A local to remote port mapping; a local port of 0 lets the OS pick one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

impl FromStr for PortPair {
    type Err = Error;

    /// Accepts `local:remote`, `:remote` and a bare `port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| Error::InvalidPortPair {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| invalid("ports must be numbers between 0 and 65535"))
        };

        let pair = match s.split_once(':') {
            Some((local, remote)) => {
                let local = if local.trim().is_empty() { 0 } else { parse(local)? };
                Self::new(local, parse(remote)?)
            }
            None => {
                let port = parse(s)?;
                Self::new(port, port)
            }
        };

        if pair.remote == 0 {
            return Err(invalid("remote port must not be 0"));
        }
        Ok(pair)
    }
}

/// Readiness of a tunnel session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    /// Carries the bound local addresses, in port pair order
    Ready(Vec<std::net::SocketAddr>),
    /// Carries the reason the session never became ready
    Failed(String),
}

// ============================================================================
// Output Types
// ============================================================================

/// Palette streams are colored from, in assignment order
const PALETTE: [Color; 10] = [
    Color::Cyan,
    Color::Green,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::DarkCyan,
    Color::DarkGreen,
    Color::DarkMagenta,
    Color::DarkYellow,
    Color::Red,
];

/// Stable per-stream color, derived from the order streams were created
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorToken(usize);

impl ColorToken {
    /// Token for the `index`-th stream created by a coordinator
    pub fn for_stream(index: usize) -> Self {
        Self(index % PALETTE.len())
    }

    pub fn index(&self) -> usize {
        self.0
    }

    /// Terminal color for this token
    pub fn color(&self) -> Color {
        PALETTE[self.0 % PALETTE.len()]
    }
}

/// When to colorize rendered output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorMode {
    /// Whether to colorize, given whether the output is a terminal
    pub fn enabled(&self, is_tty: bool) -> bool {
        match self {
            Self::Auto => is_tty,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

impl FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown color mode '{}'", other)),
        }
    }
}

/// Kind of a tagged output line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Stdout,
    Stderr,
    Control,
}

/// A single tagged line delivered to the output sink
#[derive(Clone, Debug, Serialize)]
pub struct LineRecord {
    pub source: EndpointIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub kind: LineKind,
    pub color: ColorToken,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LineRecord {
    pub fn new(
        source: EndpointIdentity,
        container: Option<String>,
        kind: LineKind,
        color: ColorToken,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source,
            container,
            kind,
            color,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Replace the arrival timestamp with the one reported by the source
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `namespace/pod` or `namespace/pod container`
    pub fn label(&self) -> String {
        match &self.container {
            Some(container) => format!("{} {}", self.source, container),
            None => self.source.to_string(),
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared stop signal for one logical operation
///
/// Cloning shares the signal. Stopping is idempotent and safe from any task.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the stop signal
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has been triggered
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// A handle stopped together with this one, which can also be stopped alone
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the tunnel and log streaming core
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Listing the cluster failed (network or auth)
    #[error("failed to list {kind}s in {scope}: {message}")]
    Resolution {
        kind: EndpointKind,
        scope: String,
        message: String,
    },

    /// Resolution succeeded but nothing matched
    #[error("no {kind} matching '{pattern}' found in {scope}")]
    NoMatch {
        kind: EndpointKind,
        pattern: String,
        scope: String,
    },

    /// Pods matched, but none had a container ready to stream
    #[error("pods matching '{pattern}' in {scope} have no streamable containers (pending or filtered out)")]
    NothingToStream { pattern: String, scope: String },

    #[error("invalid selection pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The tunnel upgrade or local listener setup failed
    #[error("port-forward to {target} failed: {message}")]
    Handshake { target: String, message: String },

    /// A read or write failed mid-session
    #[error("transport failure on {target}: {message}")]
    Transport { target: String, message: String },

    #[error("invalid filter configuration: {0}")]
    FilterConfig(String),

    #[error("invalid port pair '{input}': {reason}")]
    InvalidPortPair { input: String, reason: String },
}

impl Error {
    /// Whether a stream hitting this error may be reopened
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Human readable scope for a namespace filter
pub fn namespace_scope(namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("namespace {}", ns),
        _ => "all namespaces".to_string(),
    }
}
