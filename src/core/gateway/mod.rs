mod telegram;

use async_trait::async_trait;
use thiserror::Error;

pub use telegram::{TelegramGateway, send_with_bot};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("credential rejected by gateway: {0}")]
    Unauthorized(String),
    #[error("gateway transport failure: {0}")]
    Transport(String),
    /// The recipient blocked the bot or cannot be messaged by it.
    #[error("recipient unreachable: {0}")]
    Blocked(String),
    #[error("gateway session already closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A text message sent to the bot.
    Text(String),
    /// A user was added to, or joined, a chat the bot administers.
    MemberJoined,
    /// A user asked to join a chat the bot administers. `chat_id` is that chat.
    JoinRequest,
    /// A user left a chat the bot administers.
    MemberLeft,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub update_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub is_private: bool,
    pub kind: EventKind,
}

impl InboundEvent {
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_command(&self, command: &str) -> bool {
        self.text().is_some_and(|t| {
            let first = t.split_whitespace().next().unwrap_or("");
            let name = first.split('@').next().unwrap_or("");
            name == command
        })
    }
}

/// External messaging network the workers connect to.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Checks the credential and returns the bot identity it belongs to.
    async fn authenticate(&self, credential: &str) -> Result<BotIdentity, GatewayError>;

    async fn open_session(&self, credential: &str)
    -> Result<Box<dyn GatewaySession>, GatewayError>;
}

/// One worker's connection. Owned by the worker's poll loop.
#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Long-polls for the next batch of events. This is the loop's only
    /// suspension point on network I/O.
    async fn poll(&mut self) -> Result<Vec<InboundEvent>, GatewayError>;

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), GatewayError>;

    /// Whether `user_id` is currently a member of `channel`.
    async fn is_member(&self, channel: &str, user_id: i64) -> Result<bool, GatewayError>;

    /// Admits a pending join request to `chat_id`.
    async fn approve_join(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError>;

    /// Releases the connection. Further calls fail with [`GatewayError::Closed`].
    async fn close(&mut self);
}
