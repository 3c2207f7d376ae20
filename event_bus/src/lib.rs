//! Multiplexes many logical listeners onto one pub/sub connection.
//!
//! Workers subscribe to their own channel to learn, out of band, when their
//! container finished starting or finished a run. Several listeners may share
//! a channel; the transport-level subscription exists exactly as long as the
//! channel has at least one listener.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use data_model::{ChannelName, ControlMessage, ListenerId};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

pub mod memory;
pub mod redis_transport;
pub mod transport;

pub use memory::MemoryTransport;
pub use redis_transport::RedisTransport;
pub use transport::{Transport, TransportMessage};

pub type Listener = Arc<dyn Fn(&ChannelName, &ControlMessage) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("No such channel {0}")]
    NoSuchChannel(ChannelName),

    #[error("No such listener {0}")]
    NoSuchListener(ListenerId),
}

struct Subscription {
    listener_id: ListenerId,
    listener: Listener,
}

type SubscriptionTable = HashMap<ChannelName, Vec<Subscription>>;

pub struct EventBus {
    transport: Arc<dyn Transport>,
    subscriptions: Arc<Mutex<SubscriptionTable>>,
    dispatcher: JoinHandle<()>,
}

impl EventBus {
    /// Creates the bus and starts dispatching the transport's messages.
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        let messages = transport
            .take_messages()
            .ok_or_else(|| anyhow!("transport is already attached to an event bus"))?;
        let subscriptions = Arc::new(Mutex::new(SubscriptionTable::new()));
        let dispatcher = tokio::spawn(dispatch(subscriptions.clone(), messages));
        Ok(Self {
            transport,
            subscriptions,
            dispatcher,
        })
    }

    /// Registers `listener` on `channel`. The first listener of a channel
    /// subscribes it at the transport level.
    pub fn add_subscription(&self, channel: &ChannelName, listener_id: ListenerId, listener: Listener) {
        let requested = channel.clone();
        let wrapped: Listener = Arc::new(move |received, message| {
            if *received == requested {
                listener(received, message)
            }
        });

        let mut subscriptions = self.subscriptions.lock();
        let listeners = subscriptions.entry(channel.clone()).or_insert_with(|| {
            self.transport.subscribe(channel);
            Vec::new()
        });
        listeners.push(Subscription {
            listener_id: listener_id.clone(),
            listener: wrapped,
        });
        info!(
            channel = channel.get(),
            listener_id = listener_id.get(),
            "added subscription"
        );
    }

    /// Removes one listener. Removing the last listener of a channel also
    /// unsubscribes it at the transport level. Leaves the table untouched on
    /// error.
    pub fn remove_subscription(
        &self,
        channel: &ChannelName,
        listener_id: &ListenerId,
    ) -> Result<(), EventBusError> {
        let mut subscriptions = self.subscriptions.lock();
        let listeners = subscriptions
            .get_mut(channel)
            .ok_or_else(|| EventBusError::NoSuchChannel(channel.clone()))?;
        let index = listeners
            .iter()
            .position(|s| s.listener_id == *listener_id)
            .ok_or_else(|| EventBusError::NoSuchListener(listener_id.clone()))?;
        listeners.remove(index);

        if listeners.is_empty() {
            subscriptions.remove(channel);
            self.transport.unsubscribe(channel);
        }
        info!(
            channel = channel.get(),
            listener_id = listener_id.get(),
            "removed subscription"
        );
        Ok(())
    }

    pub async fn publish(&self, channel: &ChannelName, message: &ControlMessage) -> Result<()> {
        self.transport.publish(channel, &message.to_string()).await
    }

    pub fn subscription_count(&self, channel: &ChannelName) -> usize {
        self.subscriptions
            .lock()
            .get(channel)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    pub fn channels(&self) -> Vec<ChannelName> {
        self.subscriptions.lock().keys().cloned().collect()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    subscriptions: Arc<Mutex<SubscriptionTable>>,
    mut messages: mpsc::UnboundedReceiver<TransportMessage>,
) {
    while let Some(TransportMessage { channel, payload }) = messages.recv().await {
        let message = ControlMessage::parse(&payload);

        // Snapshot first: listeners may remove their own subscription.
        let listeners: Vec<Listener> = subscriptions
            .lock()
            .get(&channel)
            .map(|listeners| listeners.iter().map(|s| s.listener.clone()).collect())
            .unwrap_or_default();

        debug!(
            channel = channel.get(),
            message = %message,
            listeners = listeners.len(),
            "event received"
        );
        for listener in listeners {
            listener(&channel, &message);
        }
    }
    debug!("event bus dispatcher stopped");
}
