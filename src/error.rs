//! Typed errors for proxy_gate.
//!
//! Configuration and start-up failures are reported synchronously through
//! these types and are fatal to the attempt that produced them. Runtime
//! socket failures are never surfaced here; they travel as gateway events
//! so a consumer can render them without wrapping every call in a handler.
//!
//! # Error Categories
//!
//! - [`ConfigError`] - Configuration loading, parsing, and validation failures
//! - [`BalanceError`] - Load-balancer and algorithm-selection failures
//! - [`GatewayError`] - Listener binding and lifecycle failures
//! - [`ClusterError`] - Cluster start/heal failures

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::cluster::StartStep;

/// Top-level error type for proxy_gate operations.
#[derive(Debug)]
pub enum ProxyGateError {
    /// Configuration-related errors
    Config(ConfigError),
    /// Load-balancer and algorithm errors
    Balance(BalanceError),
    /// Gateway listener errors
    Gateway(GatewayError),
    /// Cluster orchestration errors
    Cluster(ClusterError),
}

impl fmt::Display for ProxyGateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Balance(e) => write!(f, "{e}"),
            Self::Gateway(e) => write!(f, "{e}"),
            Self::Cluster(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProxyGateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => e.source(),
            Self::Balance(e) => e.source(),
            Self::Gateway(e) => e.source(),
            Self::Cluster(e) => e.source(),
        }
    }
}

impl From<ConfigError> for ProxyGateError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<BalanceError> for ProxyGateError {
    fn from(e: BalanceError) -> Self {
        Self::Balance(e)
    }
}

impl From<GatewayError> for ProxyGateError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

impl From<ClusterError> for ProxyGateError {
    fn from(e: ClusterError) -> Self {
        Self::Cluster(e)
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read configuration file
    ReadFailed { path: PathBuf, source: io::Error },
    /// Failed to parse configuration file (TOML syntax error)
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Failed to write configuration file
    WriteFailed { path: PathBuf, source: io::Error },
    /// Failed to create configuration directory
    DirCreationFailed { path: PathBuf, source: io::Error },
    /// Configuration file not found (when required)
    NotFound { path: PathBuf },
    /// Failed to resolve project directories
    ProjectDirsNotFound,
    /// Two targets share the same local port
    DuplicateTarget { id: u16 },
    /// Heartbeat schedule contains no usable delay
    EmptyHeartbeat,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { path, source } => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    source
                )
            }
            Self::ParseFailed { path, source } => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    source
                )
            }
            Self::WriteFailed { path, source } => {
                write!(
                    f,
                    "Failed to write config file '{}': {}",
                    path.display(),
                    source
                )
            }
            Self::DirCreationFailed { path, source } => {
                write!(
                    f,
                    "Failed to create config directory '{}': {}",
                    path.display(),
                    source
                )
            }
            Self::NotFound { path } => {
                write!(f, "Config file not found: {}", path.display())
            }
            Self::ProjectDirsNotFound => {
                write!(f, "Could not determine config directory for this platform")
            }
            Self::DuplicateTarget { id } => {
                write!(f, "Duplicate target port {id} in configuration")
            }
            Self::EmptyHeartbeat => {
                write!(f, "Heartbeat schedule must contain at least one delay")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFailed { source, .. } => Some(source),
            Self::ParseFailed { source, .. } => Some(source),
            Self::WriteFailed { source, .. } => Some(source),
            Self::DirCreationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ============================================================================
// Load Balancer Errors
// ============================================================================

/// Errors raised by the load balancer and algorithm selection.
#[derive(Debug)]
pub enum BalanceError {
    /// The given string names no known algorithm. The message enumerates
    /// every valid identifier so a settings surface can echo it verbatim.
    InvalidAlgorithm { given: String },
}

impl fmt::Display for BalanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAlgorithm { given } => {
                write!(
                    f,
                    "Unknown load balancing algorithm '{given}', expected one of: {}",
                    crate::algorithms::Algorithm::identifiers().join(", ")
                )
            }
        }
    }
}

impl std::error::Error for BalanceError {}

// ============================================================================
// Gateway Errors
// ============================================================================

/// Errors raised while binding or managing the gateway listener.
#[derive(Debug)]
pub enum GatewayError {
    /// The requested listen port is already bound by another process
    PortInUse { port: u16 },
    /// Binding failed for a reason other than an occupied port
    BindFailed { addr: String, source: io::Error },
    /// The gateway is already listening
    AlreadyListening { addr: String },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortInUse { port } => {
                write!(f, "Port {port} is already in use")
            }
            Self::BindFailed { addr, source } => {
                write!(f, "Failed to bind gateway listener on {addr}: {source}")
            }
            Self::AlreadyListening { addr } => {
                write!(f, "Gateway is already listening on {addr}")
            }
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ============================================================================
// Cluster Errors
// ============================================================================

/// Errors raised by the cluster manager.
#[derive(Debug)]
pub enum ClusterError {
    /// Every member is gone and no replacement could be connected
    PoolEmpty,
    /// The candidate config list has no entry that is not already in use
    NoAvailableConfig,
    /// A start-pipeline step failed; everything after it was skipped
    StartFailed { step: StartStep, message: String },
    /// An operation that requires a running cluster found none
    NotRunning,
    /// An operation that requires a stopped cluster found one running
    AlreadyRunning,
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolEmpty => {
                write!(f, "Cluster pool is empty, no upstream member left to serve")
            }
            Self::NoAvailableConfig => {
                write!(f, "No candidate config available that is not already in use")
            }
            Self::StartFailed { step, message } => {
                write!(f, "Cluster start failed at step '{step}': {message}")
            }
            Self::NotRunning => write!(f, "Cluster is not running"),
            Self::AlreadyRunning => write!(f, "Cluster is already running"),
        }
    }
}

impl std::error::Error for ClusterError {}
