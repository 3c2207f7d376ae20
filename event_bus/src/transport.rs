use anyhow::Result;
use async_trait::async_trait;
use data_model::ChannelName;
use tokio::sync::mpsc;

/// A raw message as delivered by the pub/sub connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: ChannelName,
    pub payload: String,
}

/// The pub/sub connection underneath an [`crate::EventBus`].
///
/// `subscribe` and `unsubscribe` are fire-and-forget: implementations either
/// apply them immediately or queue them for their connection task. Messages
/// for every subscribed channel flow through a single stream, handed out once
/// by `take_messages`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn subscribe(&self, channel: &ChannelName);

    fn unsubscribe(&self, channel: &ChannelName);

    async fn publish(&self, channel: &ChannelName, payload: &str) -> Result<()>;

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<TransportMessage>>;
}
