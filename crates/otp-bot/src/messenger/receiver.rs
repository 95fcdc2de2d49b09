//! Inbox polling for the bot's number.

use super::client::SignalClient;
use super::types::BotMessage;
use std::time::Duration;
use tokio::time::sleep;
use tokio_stream::Stream;
use tracing::{debug, error};

/// First pause after a failed poll. Doubles per failure up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Turns the bridge inbox into a stream of text messages.
pub struct MessageReceiver {
    client: SignalClient,
    poll_interval: Duration,
}

impl MessageReceiver {
    pub fn new(client: SignalClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Poll forever, yielding messages in arrival order.
    ///
    /// Envelopes without text and echoes of the bot's own sends are skipped.
    pub fn stream(self) -> impl Stream<Item = BotMessage> {
        async_stream::stream! {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match self.client.receive().await {
                    Ok(batch) => {
                        backoff = INITIAL_BACKOFF;
                        for message in batch.iter().filter_map(BotMessage::from_incoming) {
                            if message.source == self.client.bot_number() {
                                continue;
                            }
                            debug!("Received {} from {}", describe(&message), message.source);
                            yield message;
                        }
                        sleep(self.poll_interval).await;
                    }
                    Err(e) => {
                        error!("Inbox poll failed, retrying in {:?}: {}", backoff, e);
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
    }
}

/// Command word of a message, or "text". Plain text may hold credentials.
fn describe(message: &BotMessage) -> &str {
    match message.command().0 {
        word if word.starts_with('!') => word,
        _ => "text",
    }
}
