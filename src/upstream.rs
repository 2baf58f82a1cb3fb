//! Collaborator seams for the processes behind the gateway.
//!
//! The cluster manager treats the upstream proxy client as an opaque
//! capability: something that can connect (reporting the local port it
//! bound), disconnect, and say which configuration produced it. How the
//! process is spawned is not this crate's concern; embedders supply a
//! [`ClientFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Source configuration for one upstream client. Everything beyond the id
/// and weight is carried opaquely for the factory's benefit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Identifies this configuration across the candidate pool
    pub id: String,
    #[serde(default)]
    pub remark: Option<String>,
    /// Local port the client binds in single mode, when known up front
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Weight applied to the target this config produces
    #[serde(default)]
    pub weight: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClientConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remark: None,
            local_port: None,
            weight: 0,
            extra: serde_json::Map::new(),
        }
    }
}

/// Outcome of a connect or disconnect call.
///
/// Always a resolved value, never an `Err`: consumers render `message`
/// without a handler around every call, and partial failures stay data.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub ok: bool,
    /// Local port the client bound, present on a successful connect
    pub port: Option<u16>,
    pub message: Option<String>,
}

impl ClientStatus {
    pub fn connected(port: u16) -> Self {
        Self {
            ok: true,
            port: Some(port),
            message: None,
        }
    }

    pub fn done() -> Self {
        Self {
            ok: true,
            port: None,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            port: None,
            message: Some(message.into()),
        }
    }
}

/// One upstream proxy client process.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Id of the configuration this client was built from.
    fn conf_id(&self) -> &str;

    /// Local port the client is bound to, if connected.
    fn local_port(&self) -> Option<u16>;

    fn is_connected(&self) -> bool;

    /// Spawn/connect the underlying process. Resolves to a status; a spawn
    /// or handshake failure is `ok == false`, not an `Err`.
    async fn connect(&self) -> ClientStatus;

    /// Tear the underlying process down.
    async fn disconnect(&self) -> ClientStatus;
}

/// Builds upstream clients from configurations.
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &ClientConfig) -> Arc<dyn UpstreamClient>;
}

/// OS-level system proxy toggle, enabled on start and disabled on every
/// teardown or mode change.
pub trait SystemProxy: Send + Sync {
    fn enable(&self, port: u16) -> anyhow::Result<()>;
    fn disable(&self) -> anyhow::Result<()>;
}

/// No-op toggle for headless deployments.
pub struct NoSystemProxy;

impl SystemProxy for NoSystemProxy {
    fn enable(&self, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    fn disable(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
