//! Message passing between hive components.
//!
//! Every exchange is a [`Message`] envelope with a MessagePack payload. The
//! [`Network`] routes envelopes between registered addresses inside one
//! process; endpoints can be killed to simulate a crashed peer.

pub mod error;
pub mod message;
pub mod network;
pub mod rpc;

pub use error::CommError;
pub use message::{Message, MessageKind};
pub use network::{Endpoint, EndpointHandle, Network, NetworkEvent};
pub use rpc::PendingReplies;
