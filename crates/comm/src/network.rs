//! In-process message router.
//!
//! Components register an [`Address`] with [`Network::listen`] and receive an
//! [`Endpoint`]: an inbox plus a cloneable [`EndpointHandle`] for sending,
//! replying and issuing requests. Dropping the endpoint unregisters it;
//! [`Network::kill`] tears it down abruptly, the way a crashed process
//! disappears. Both are announced to [`Network::subscribe`]rs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hive_core::{Address, CommConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

use crate::error::CommError;
use crate::message::Message;
use crate::rpc::PendingReplies;

const EVENT_CAPACITY: usize = 1024;

/// Membership change observed on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// `address` stopped listening. `killed` marks an abrupt teardown.
    Disconnected { address: Address, killed: bool },
}

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    killed: watch::Sender<bool>,
    pending: PendingReplies,
}

struct NetworkInner {
    routes: Mutex<HashMap<Address, Route>>,
    events: broadcast::Sender<NetworkEvent>,
    next_id: AtomicU64,
    offload_threshold: usize,
}

/// Shared router; cheap to clone.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new(config: &CommConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(NetworkInner {
                routes: Mutex::new(HashMap::new()),
                events,
                next_id: AtomicU64::new(1),
                offload_threshold: config.offload_threshold_bytes,
            }),
        }
    }

    /// Payloads estimated above this many bytes are encoded off the caller's task.
    pub fn offload_threshold(&self) -> usize {
        self.inner.offload_threshold
    }

    /// Start listening at `address`.
    pub fn listen(&self, address: Address) -> Result<Endpoint, CommError> {
        let mut routes = self.routes();
        if routes.contains_key(&address) {
            return Err(CommError::AddressInUse(address));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, inbox) = mpsc::unbounded_channel();
        let (killed_tx, killed) = watch::channel(false);
        let pending = PendingReplies::new();
        routes.insert(
            address.clone(),
            Route {
                id,
                tx,
                killed: killed_tx,
                pending: pending.clone(),
            },
        );
        drop(routes);
        debug!(address = %address, "endpoint listening");

        Ok(Endpoint {
            handle: EndpointHandle {
                address,
                network: self.clone(),
                pending,
                killed: killed.clone(),
            },
            inbox,
            killed,
            id,
        })
    }

    /// Hand `message` to the endpoint listening at `to`.
    pub fn deliver(&self, to: &Address, message: Message) -> Result<(), CommError> {
        let routes = self.routes();
        let route = routes
            .get(to)
            .ok_or_else(|| CommError::UnknownAddress(to.clone()))?;
        route
            .tx
            .send(message)
            .map_err(|_| CommError::ConnectionClosed(to.clone()))
    }

    /// Abruptly tear down the endpoint at `address`: its inbox stops yielding,
    /// its sends fail and its outstanding requests are abandoned.
    pub fn kill(&self, address: &Address) -> bool {
        let Some(route) = self.routes().remove(address) else {
            return false;
        };
        route.killed.send_replace(true);
        route.pending.clear();
        info!(address = %address, "endpoint killed");
        self.announce(NetworkEvent::Disconnected {
            address: address.clone(),
            killed: true,
        });
        true
    }

    pub fn is_listening(&self, address: &Address) -> bool {
        self.routes().contains_key(address)
    }

    /// Receive membership events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    fn unregister(&self, address: &Address, id: u64) {
        let mut routes = self.routes();
        if routes.get(address).is_some_and(|r| r.id == id) {
            routes.remove(address);
            drop(routes);
            debug!(address = %address, "endpoint closed");
            self.announce(NetworkEvent::Disconnected {
                address: address.clone(),
                killed: false,
            });
        }
    }

    fn announce(&self, event: NetworkEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<Address, Route>> {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new(&CommConfig::default())
    }
}

/// Receiving side of a registered address. Owned by the component's control loop.
pub struct Endpoint {
    handle: EndpointHandle,
    inbox: mpsc::UnboundedReceiver<Message>,
    killed: watch::Receiver<bool>,
    id: u64,
}

impl Endpoint {
    pub fn address(&self) -> &Address {
        &self.handle.address
    }

    pub fn handle(&self) -> EndpointHandle {
        self.handle.clone()
    }

    /// Next event or request addressed to this endpoint.
    ///
    /// Replies are routed to their waiting requesters internally and never
    /// returned. Yields `None` once the endpoint has been killed. Cancel safe.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if *self.killed.borrow() {
                return None;
            }
            let message = tokio::select! {
                biased;
                _ = self.killed.changed() => return None,
                message = self.inbox.recv() => message?,
            };
            if message.is_reply() {
                self.handle.pending.resolve(message);
                continue;
            }
            return Some(message);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.handle.pending.clear();
        self.handle.network.unregister(&self.handle.address, self.id);
    }
}

/// Sending side of an endpoint; cheap to clone and share with spawned tasks.
#[derive(Clone)]
pub struct EndpointHandle {
    address: Address,
    network: Network,
    pending: PendingReplies,
    killed: watch::Receiver<bool>,
}

impl EndpointHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn is_killed(&self) -> bool {
        *self.killed.borrow()
    }

    /// Send a fire-and-forget event.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        to: &Address,
        op: &str,
        payload: &T,
    ) -> Result<(), CommError> {
        let message = Message::new(op, &self.address, payload)?;
        self.send_message(to, message)
    }

    pub fn send_message(&self, to: &Address, message: Message) -> Result<(), CommError> {
        if self.is_killed() {
            return Err(CommError::ConnectionClosed(self.address.clone()));
        }
        self.network.deliver(to, message)
    }

    /// Answer `request` with `payload`.
    pub fn reply<T: Serialize + ?Sized>(
        &self,
        request: &Message,
        payload: &T,
    ) -> Result<(), CommError> {
        let message = Message::reply(request.correlation_id, &self.address, payload)?;
        self.send_message(&request.sender, message)
    }

    /// Answer `request`, encoding on the blocking pool when `size_hint`
    /// exceeds the network's offload threshold.
    pub async fn reply_offloaded<T>(
        &self,
        request: &Message,
        payload: T,
        size_hint: usize,
    ) -> Result<(), CommError>
    where
        T: Serialize + Send + 'static,
    {
        let message = Message::reply_offloaded(
            request.correlation_id,
            &self.address,
            payload,
            size_hint,
            self.network.offload_threshold(),
        )
        .await?;
        self.send_message(&request.sender, message)
    }

    /// Send a request and wait up to `timeout` for the typed reply.
    pub async fn request<T, R>(
        &self,
        to: &Address,
        op: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, CommError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let message = Message::request(op, &self.address, payload)?;
        let cid = message.correlation_id;
        let rx = self.pending.register(cid);
        if let Err(e) = self.send_message(to, message) {
            self.pending.cancel(&cid);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply.decode(),
            Ok(Err(_)) => Err(CommError::ConnectionClosed(self.address.clone())),
            Err(_) => {
                self.pending.cancel(&cid);
                Err(CommError::Timeout(timeout))
            }
        }
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("address", &self.address)
            .finish()
    }
}
