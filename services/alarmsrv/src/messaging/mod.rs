//! Messaging fabric seam
//!
//! The manager only needs subscribe/send/broadcast plus a readiness flag; the
//! transport behind it is Redis pub/sub in production and an in-memory
//! recorder offline and in tests.

pub mod memory;
pub mod pubsub;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::Message;

pub use self::memory::MemoryMessaging;
pub use self::pubsub::RedisMessaging;

#[async_trait]
pub trait Messaging: Send + Sync {
    /// Identity of this service on the fabric
    fn name(&self) -> &str;

    /// Whether messages can currently be delivered
    fn is_ready(&self) -> bool;

    /// Receive broadcasts from `source`
    async fn subscribe(&self, source: &str) -> Result<()>;

    /// Deliver to `message.target`
    async fn send(&self, message: Message) -> Result<()>;

    /// Deliver to every subscriber of this service
    async fn broadcast(&self, message: Message) -> Result<()>;
}

/// Receiver of inbound messages
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, message: Message);
}
