//! Redis pub/sub transport
//!
//! Channels:
//! - `<prefix>:inbox:<name>`: direct messages for one service
//! - `<prefix>:broadcast:<name>`: broadcasts from one service
//!
//! The listener subscribes to its own inbox and pattern-subscribes to every
//! broadcast channel, delivering only those from subscribed sources.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{InboundHandler, Messaging};
use crate::error::{AlarmError, Result};
use crate::messages::{self, Message};

pub struct RedisMessaging {
    name: String,
    prefix: String,
    client: Client,
    conn: ConnectionManager,
    ready: AtomicBool,
    subscriptions: RwLock<HashSet<String>>,
    retry_interval: Duration,
}

impl RedisMessaging {
    pub async fn connect(url: &str, prefix: &str, name: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Redis messaging connected: {} as {}", url, name);

        Ok(Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            client,
            conn,
            ready: AtomicBool::new(false),
            subscriptions: RwLock::new(HashSet::new()),
            retry_interval: Duration::from_secs(3),
        })
    }

    pub fn inbox_channel(&self, name: &str) -> String {
        format!("{}:inbox:{}", self.prefix, name)
    }

    pub fn broadcast_channel(&self, name: &str) -> String {
        format!("{}:broadcast:{}", self.prefix, name)
    }

    async fn publish(&self, channel: String, message: &Message) -> Result<()> {
        let payload = messages::encode(message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!("Pub {} -> {} receivers", channel, receivers);
        Ok(())
    }

    /// Run the inbound listener until `token` fires, reconnecting on errors
    pub fn spawn_listener(
        self: &Arc<Self>,
        handler: Arc<dyn InboundHandler>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.listen(&handler, &token).await {
                    warn!("Pubsub listener: {}", e);
                }
                this.ready.store(false, Ordering::SeqCst);

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(this.retry_interval) => {},
                }
            }
            debug!("Pubsub listener stopped");
        })
    }

    async fn listen(&self, handler: &Arc<dyn InboundHandler>, token: &CancellationToken) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.inbox_channel(&self.name)).await?;
        pubsub
            .psubscribe(format!("{}:broadcast:*", self.prefix))
            .await?;

        self.ready.store(true, Ordering::SeqCst);
        info!("Pubsub listening: {}", self.name);

        let broadcast_prefix = format!("{}:broadcast:", self.prefix);
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(AlarmError::transient("pubsub", "stream closed"));
                    };

                    let channel = msg.get_channel_name().to_string();
                    if let Some(sender) = channel.strip_prefix(broadcast_prefix.as_str()) {
                        let subscribed = self.subscriptions.read().contains(sender);
                        if !subscribed {
                            continue;
                        }
                    }

                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Payload on {}: {}", channel, e);
                            continue;
                        },
                    };

                    match messages::decode(&payload) {
                        Ok(message) => handler.on_message(message).await,
                        Err(e) => warn!("Bad message on {}: {}", channel, e),
                    }
                }
                _ = token.cancelled() => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Messaging for RedisMessaging {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, source: &str) -> Result<()> {
        if self.subscriptions.write().insert(source.to_string()) {
            info!("Subscribed: {}", source);
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        let target = message
            .target
            .clone()
            .ok_or_else(|| AlarmError::validation("message has no target"))?;
        self.publish(self.inbox_channel(&target), &message).await
    }

    async fn broadcast(&self, message: Message) -> Result<()> {
        self.publish(self.broadcast_channel(&self.name), &message).await
    }
}
