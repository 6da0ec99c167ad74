//! Transfers of task results between workers.

use std::time::Duration;

use async_trait::async_trait;
use hive_comm::{CommError, EndpointHandle};
use hive_core::protocol::{DataResponse, ToWorker};
use hive_core::{Address, TaskKey};
use tracing::debug;

/// Fetches results held by another worker.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn get_data(
        &self,
        peer: &Address,
        keys: &[TaskKey],
        timeout: Duration,
    ) -> Result<DataResponse, CommError>;
}

/// [`PeerTransport`] over the cluster network.
#[derive(Debug, Clone)]
pub struct NetworkPeers {
    handle: EndpointHandle,
}

impl NetworkPeers {
    pub fn new(handle: EndpointHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl PeerTransport for NetworkPeers {
    async fn get_data(
        &self,
        peer: &Address,
        keys: &[TaskKey],
        timeout: Duration,
    ) -> Result<DataResponse, CommError> {
        let msg = ToWorker::GetData {
            keys: keys.to_vec(),
        };
        self.handle.request(peer, msg.op(), &msg, timeout).await
    }
}

/// Fetch `keys` from `peer`, retrying transient failures up to `attempts`
/// times in total.
pub async fn gather_from_peer(
    transport: &dyn PeerTransport,
    peer: &Address,
    keys: &[TaskKey],
    attempts: u32,
    timeout: Duration,
) -> Result<DataResponse, CommError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match transport.get_data(peer, keys, timeout).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && attempt < attempts => {
                debug!(peer = %peer, attempt, error = %e, "retrying gather");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
