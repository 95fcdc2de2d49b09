//! Concurrent message handling with per-chat ordering.
//!
//! Each sender gets a worker task fed through a channel. A slow command only
//! holds up its own chat, and one chat's messages are answered in arrival
//! order. Idle workers exit and are started again on the next message.

use crate::commands::CommandHandler;
use crate::dispatch;
use crate::messenger::{BotMessage, SignalClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

/// How long a chat worker waits for its next message before exiting.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Handlers = Arc<Vec<Box<dyn CommandHandler>>>;

/// Routes incoming messages to per-chat workers.
pub struct ChatDispatcher {
    handlers: Handlers,
    signal: SignalClient,
    chats: HashMap<String, UnboundedSender<BotMessage>>,
    idle_timeout: Duration,
}

impl ChatDispatcher {
    pub fn new(handlers: Vec<Box<dyn CommandHandler>>, signal: SignalClient) -> Self {
        Self {
            handlers: Arc::new(handlers),
            signal,
            chats: HashMap::new(),
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Queue a message on its sender's worker, starting one if needed.
    pub fn submit(&mut self, message: BotMessage) {
        let chat = message.source.clone();
        let message = match self.chats.get(&chat) {
            Some(queue) => match queue.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        self.chats.retain(|_, queue| !queue.is_closed());

        let (queue, inbox) = mpsc::unbounded_channel();
        if let Err(e) = queue.send(message) {
            error!("Dropped message from {}: {}", chat, e);
            return;
        }
        self.chats.insert(chat.clone(), queue);

        debug!("Starting chat worker for {}", chat);
        tokio::spawn(run_chat(
            chat,
            inbox,
            self.handlers.clone(),
            self.signal.clone(),
            self.idle_timeout,
        ));
    }

    /// Chats with a running worker.
    pub fn active_chats(&self) -> usize {
        self.chats.values().filter(|queue| !queue.is_closed()).count()
    }
}

async fn run_chat(
    chat: String,
    mut inbox: UnboundedReceiver<BotMessage>,
    handlers: Handlers,
    signal: SignalClient,
    idle_timeout: Duration,
) {
    loop {
        match tokio::time::timeout(idle_timeout, inbox.recv()).await {
            Ok(Some(message)) => answer(&handlers, &signal, &message).await,
            Ok(None) => return,
            Err(_) => break,
        }
    }

    // Anything queued before the close still gets answered
    inbox.close();
    while let Ok(message) = inbox.try_recv() {
        answer(&handlers, &signal, &message).await;
    }
    debug!("Chat worker for {} idle, exiting", chat);
}

async fn answer(handlers: &[Box<dyn CommandHandler>], signal: &SignalClient, message: &BotMessage) {
    if let Some(response) = dispatch(handlers, message).await {
        if let Err(e) = signal.reply(message, &response).await {
            error!("Failed to send reply to {}: {}", message.reply_target(), e);
        }
    }
}
