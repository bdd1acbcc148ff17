//! In-process messaging that records traffic

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::Messaging;
use crate::error::{AlarmError, Result};
use crate::messages::Message;

#[derive(Debug)]
pub struct MemoryMessaging {
    name: String,
    ready: AtomicBool,
    subscriptions: Mutex<BTreeSet<String>>,
    sent: Mutex<Vec<Message>>,
    broadcasts: Mutex<Vec<Message>>,
}

impl MemoryMessaging {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: AtomicBool::new(true),
            subscriptions: Mutex::new(BTreeSet::new()),
            sent: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn broadcasts(&self) -> Vec<Message> {
        self.broadcasts.lock().clone()
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl Messaging for MemoryMessaging {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, source: &str) -> Result<()> {
        self.subscriptions.lock().insert(source.to_string());
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        if !self.is_ready() {
            return Err(AlarmError::transient("send", "messaging not ready"));
        }
        if message.target.is_none() {
            return Err(AlarmError::validation("message has no target"));
        }
        debug!("Mem send {:?} -> {:?}", message.message_type, message.target);
        self.sent.lock().push(message);
        Ok(())
    }

    async fn broadcast(&self, message: Message) -> Result<()> {
        if !self.is_ready() {
            return Err(AlarmError::transient("broadcast", "messaging not ready"));
        }
        self.broadcasts.lock().push(message);
        Ok(())
    }
}
