use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::ChannelName;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::{aio::PubSub, AsyncCommands};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::transport::{Transport, TransportMessage};

enum Command {
    Subscribe(ChannelName),
    Unsubscribe(ChannelName),
}

enum PubSubEvent {
    Command(Option<Command>),
    Message(Option<redis::Msg>),
}

/// Redis pub/sub transport. One dedicated connection carries the
/// subscriptions, a multiplexed one is used for publishing.
pub struct RedisTransport {
    commands: mpsc::UnboundedSender<Command>,
    publisher: redis::aio::MultiplexedConnection,
    messages: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
}

impl RedisTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid event broker url")?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .context("error connecting publisher to event broker")?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .context("error connecting subscriber to event broker")?;
        info!(url, "connected to event broker");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_pubsub(pubsub, commands_rx, messages_tx));

        Ok(Self {
            commands: commands_tx,
            publisher,
            messages: Mutex::new(Some(messages_rx)),
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("event broker connection task is gone, dropping subscription change");
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn subscribe(&self, channel: &ChannelName) {
        self.send(Command::Subscribe(channel.clone()));
    }

    fn unsubscribe(&self, channel: &ChannelName) {
        self.send(Command::Unsubscribe(channel.clone()));
    }

    async fn publish(&self, channel: &ChannelName, payload: &str) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn
            .publish(channel.get(), payload)
            .await
            .with_context(|| format!("error publishing to {channel}"))?;
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<TransportMessage>> {
        self.messages.lock().take()
    }
}

async fn run_pubsub(
    mut pubsub: PubSub,
    mut commands: mpsc::UnboundedReceiver<Command>,
    messages: mpsc::UnboundedSender<TransportMessage>,
) {
    loop {
        let event = {
            let stream = pubsub.on_message();
            tokio::pin!(stream);
            tokio::select! {
                command = commands.recv() => PubSubEvent::Command(command),
                msg = stream.next() => PubSubEvent::Message(msg),
            }
        };

        match event {
            PubSubEvent::Command(None) => break,
            PubSubEvent::Command(Some(Command::Subscribe(channel))) => {
                if let Err(err) = pubsub.subscribe(channel.get()).await {
                    error!(channel = channel.get(), "error subscribing: {:?}", err);
                }
            }
            PubSubEvent::Command(Some(Command::Unsubscribe(channel))) => {
                if let Err(err) = pubsub.unsubscribe(channel.get()).await {
                    warn!(channel = channel.get(), "error unsubscribing: {:?}", err);
                }
            }
            PubSubEvent::Message(None) => {
                error!("event broker subscription stream closed");
                break;
            }
            PubSubEvent::Message(Some(msg)) => {
                let channel = ChannelName::from(msg.get_channel_name());
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel = channel.get(), "undecodable payload: {:?}", err);
                        continue;
                    }
                };
                if messages.send(TransportMessage { channel, payload }).is_err() {
                    break;
                }
            }
        }
    }
    info!("event broker subscription loop stopped");
}
