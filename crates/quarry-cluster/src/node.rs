//! Node slot management.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use quarry_curl::{CurlError, CurlResult, HttpEndpoint};
use quarry_engine::{Client, Engine, EngineError, EngineNode};
use quarry_types::{ClusterIdentity, Settings};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::{Error, Result};

/// Node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// An engine instance is serving requests.
    Running,
    /// No instance, or the instance was closed.
    Closed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One slot of the cluster.
///
/// The ordinal, name and configuration are fixed for the life of the
/// cluster; closing and restarting only swaps the engine instance.
pub struct NodeHandle {
    config: NodeConfig,
    identity: ClusterIdentity,
    engine: Arc<dyn Engine>,
    instance: Mutex<Option<Arc<dyn EngineNode>>>,
}

impl NodeHandle {
    /// Creates the slot and starts its first instance.
    pub(crate) fn launch(
        engine: Arc<dyn Engine>,
        identity: ClusterIdentity,
        config: NodeConfig,
    ) -> Result<Self> {
        let instance = start_instance(engine.as_ref(), &identity, &config)?;
        Ok(Self {
            config,
            identity,
            engine,
            instance: Mutex::new(Some(instance)),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.config.ordinal
    }

    /// Display name, `Node <ordinal+1>`.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Arc<dyn EngineNode>>>> {
        self.instance
            .lock()
            .map_err(|_| Error::Engine(EngineError::internal("node handle lock poisoned")))
    }

    /// The live instance, if the slot is running.
    fn running_instance(&self) -> Option<Arc<dyn EngineNode>> {
        let guard = self.lock().ok()?;
        guard
            .as_ref()
            .filter(|instance| !instance.is_closed())
            .map(Arc::clone)
    }

    fn require_instance(&self) -> Result<Arc<dyn EngineNode>> {
        self.running_instance()
            .ok_or_else(|| Error::Engine(EngineError::NodeClosed(self.config.name.clone())))
    }

    pub fn status(&self) -> NodeStatus {
        if self.running_instance().is_some() {
            NodeStatus::Running
        } else {
            NodeStatus::Closed
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status() == NodeStatus::Closed
    }

    /// Id of the current instance; changes on every restart.
    pub fn instance_id(&self) -> Option<Uuid> {
        self.running_instance().map(|instance| instance.instance_id())
    }

    /// Effective settings of the running instance, including bound ports.
    pub fn settings(&self) -> Option<Settings> {
        self.running_instance()
            .map(|instance| instance.settings().clone())
    }

    pub fn http_address(&self) -> Option<SocketAddr> {
        self.running_instance()
            .and_then(|instance| instance.http_address())
    }

    pub fn transport_address(&self) -> Option<SocketAddr> {
        self.running_instance()
            .map(|instance| instance.transport_address())
    }

    /// Client bound to the running instance.
    pub fn client(&self) -> Result<Arc<dyn Client>> {
        Ok(self.require_instance()?.client())
    }

    /// Closes this node only. Idempotent.
    #[instrument(skip(self), fields(node = %self.config.name))]
    pub fn close(&self) -> Result<()> {
        let instance = self.lock()?.take();
        if let Some(instance) = instance {
            instance.close()?;
            info!("node closed");
        }
        Ok(())
    }

    /// Starts a fresh instance if the slot is closed.
    ///
    /// Returns `true` when a new instance was started and `false` when the
    /// slot was already running.
    #[instrument(skip(self), fields(node = %self.config.name))]
    pub fn start(&self) -> Result<bool> {
        let mut guard = self.lock()?;
        if guard.as_ref().is_some_and(|instance| !instance.is_closed()) {
            return Ok(false);
        }
        let instance = start_instance(self.engine.as_ref(), &self.identity, &self.config)?;
        info!(instance = %instance.instance_id(), "node restarted");
        *guard = Some(instance);
        Ok(true)
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("ordinal", &self.config.ordinal)
            .field("name", &self.config.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl HttpEndpoint for NodeHandle {
    fn http_endpoint(&self) -> CurlResult<SocketAddr> {
        self.http_address().ok_or_else(|| {
            CurlError::NoHttpEndpoint(format!("{} has no running http endpoint", self.name()))
        })
    }
}

fn start_instance(
    engine: &dyn Engine,
    identity: &ClusterIdentity,
    config: &NodeConfig,
) -> Result<Arc<dyn EngineNode>> {
    engine
        .start(identity, config.ordinal, config.settings.clone())
        .map_err(|source| Error::Launch {
            ordinal: config.ordinal,
            source,
        })
}
