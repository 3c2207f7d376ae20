use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use data_model::ChannelName;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::transport::{Transport, TransportMessage};

/// In-process broker with Redis pub/sub semantics: a published message is
/// delivered only if its channel is subscribed at the time of publishing.
pub struct MemoryTransport {
    subscribed: Mutex<HashSet<ChannelName>>,
    sink: mpsc::UnboundedSender<TransportMessage>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (sink, messages) = mpsc::unbounded_channel();
        Self {
            subscribed: Mutex::new(HashSet::new()),
            sink,
            messages: Mutex::new(Some(messages)),
        }
    }

    pub fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.subscribed.lock().contains(channel)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn subscribe(&self, channel: &ChannelName) {
        self.subscribed.lock().insert(channel.clone());
    }

    fn unsubscribe(&self, channel: &ChannelName) {
        self.subscribed.lock().remove(channel);
    }

    async fn publish(&self, channel: &ChannelName, payload: &str) -> Result<()> {
        if !self.is_subscribed(channel) {
            trace!(channel = channel.get(), "no subscribers, dropping message");
            return Ok(());
        }
        self.sink.send(TransportMessage {
            channel: channel.clone(),
            payload: payload.to_string(),
        })?;
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<TransportMessage>> {
        self.messages.lock().take()
    }
}
