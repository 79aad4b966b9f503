use async_trait::async_trait;
use std::time::Duration;
use teloxide::payloads::GetUpdatesSetters;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, ChatMemberUpdated, Recipient, UpdateKind};
use teloxide::{ApiError, RequestError};
use tracing::debug;

use super::{BotIdentity, EventKind, GatewayError, GatewaySession, InboundEvent, MessagingGateway};

fn map_request_error(err: RequestError) -> GatewayError {
    match err {
        RequestError::Api(ApiError::InvalidToken) => {
            GatewayError::Unauthorized("invalid bot token".to_string())
        }
        RequestError::Api(
            api @ (ApiError::BotBlocked
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation),
        ) => GatewayError::Blocked(api.to_string()),
        other => GatewayError::Transport(other.to_string()),
    }
}

/// Telegram Bot API over long polling.
pub struct TelegramGateway {
    poll_timeout_secs: u32,
}

impl TelegramGateway {
    pub fn new(poll_timeout_secs: u32) -> Self {
        Self { poll_timeout_secs }
    }

    fn bot(&self, credential: &str) -> Result<Bot, GatewayError> {
        // Request timeout must outlast the server-side long poll.
        let client = teloxide::net::default_reqwest_settings()
            .timeout(Duration::from_secs(u64::from(self.poll_timeout_secs) + 10))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Bot::with_client(credential, client))
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn authenticate(&self, credential: &str) -> Result<BotIdentity, GatewayError> {
        let bot = self.bot(credential)?;
        let me = bot.get_me().await.map_err(|e| match e {
            RequestError::Api(api) => GatewayError::Unauthorized(api.to_string()),
            other => GatewayError::Transport(other.to_string()),
        })?;
        Ok(BotIdentity {
            id: me.user.id.0 as i64,
            username: me.user.username.clone().unwrap_or_default(),
        })
    }

    async fn open_session(
        &self,
        credential: &str,
    ) -> Result<Box<dyn GatewaySession>, GatewayError> {
        Ok(Box::new(TelegramSession {
            bot: Some(self.bot(credential)?),
            offset: 0,
            timeout_secs: self.poll_timeout_secs,
        }))
    }
}

pub struct TelegramSession {
    bot: Option<Bot>,
    offset: i32,
    timeout_secs: u32,
}

impl TelegramSession {
    fn bot(&self) -> Result<&Bot, GatewayError> {
        self.bot.as_ref().ok_or(GatewayError::Closed)
    }
}

/// Offset that acknowledges `update_id`. Update ids are unsigned on the
/// wire while `getUpdates` takes a signed offset.
fn next_offset(update_id: u32) -> Result<i32, GatewayError> {
    i32::try_from(update_id)
        .ok()
        .and_then(|id| id.checked_add(1))
        .ok_or_else(|| {
            GatewayError::Transport(format!("update id {update_id} is outside the offset range"))
        })
}

fn member_left(update: &ChatMemberUpdated) -> bool {
    update.old_chat_member.kind.is_present() && !update.new_chat_member.kind.is_present()
}

fn member_joined(update: &ChatMemberUpdated) -> bool {
    !update.old_chat_member.kind.is_present() && update.new_chat_member.kind.is_present()
}

/// Maps one update to the event the workers handle. Updates about other
/// bots, and kinds no handler uses, yield `None`.
fn to_event(update_id: i64, kind: UpdateKind) -> Option<InboundEvent> {
    match kind {
        UpdateKind::Message(msg) => {
            let text = msg.text()?;
            let user = msg.from.as_ref()?;
            Some(InboundEvent {
                update_id,
                chat_id: msg.chat.id.0,
                user_id: user.id.0 as i64,
                is_private: msg.chat.is_private(),
                kind: EventKind::Text(text.to_string()),
            })
        }
        UpdateKind::ChatJoinRequest(request) if !request.from.is_bot => Some(InboundEvent {
            update_id,
            chat_id: request.chat.id.0,
            user_id: request.from.id.0 as i64,
            is_private: false,
            kind: EventKind::JoinRequest,
        }),
        UpdateKind::ChatMember(change) if !change.new_chat_member.user.is_bot => {
            let kind = if member_joined(&change) {
                EventKind::MemberJoined
            } else if member_left(&change) {
                EventKind::MemberLeft
            } else {
                return None;
            };
            Some(InboundEvent {
                update_id,
                chat_id: change.chat.id.0,
                user_id: change.new_chat_member.user.id.0 as i64,
                is_private: false,
                kind,
            })
        }
        _ => None,
    }
}

#[async_trait]
impl GatewaySession for TelegramSession {
    async fn poll(&mut self) -> Result<Vec<InboundEvent>, GatewayError> {
        let updates = self
            .bot()?
            .get_updates()
            .offset(self.offset)
            .timeout(self.timeout_secs)
            .allowed_updates(vec![
                AllowedUpdate::Message,
                AllowedUpdate::ChatMember,
                AllowedUpdate::ChatJoinRequest,
            ])
            .await
            .map_err(map_request_error)?;

        let mut events = Vec::with_capacity(updates.len());
        for update in updates {
            self.offset = next_offset(update.id.0)?;
            if let Some(event) = to_event(i64::from(update.id.0), update.kind) {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), GatewayError> {
        self.bot()?
            .send_message(ChatId(chat_id), text)
            .await
            .map(|_| ())
            .map_err(map_request_error)
    }

    async fn is_member(&self, channel: &str, user_id: i64) -> Result<bool, GatewayError> {
        let recipient = match channel.parse::<i64>() {
            Ok(id) => Recipient::Id(ChatId(id)),
            Err(_) => Recipient::ChannelUsername(channel.to_string()),
        };
        let member = self
            .bot()?
            .get_chat_member(recipient, UserId(user_id as u64))
            .await
            .map_err(map_request_error)?;
        Ok(member.kind.is_present())
    }

    async fn approve_join(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError> {
        self.bot()?
            .approve_chat_join_request(ChatId(chat_id), UserId(user_id as u64))
            .await
            .map(|_| ())
            .map_err(map_request_error)
    }

    async fn close(&mut self) {
        if self.bot.take().is_some() {
            debug!("telegram session closed");
        }
    }
}

/// Sends plain messages from a fixed bot, used for owner notices.
pub async fn send_with_bot(bot: &Bot, chat_id: i64, text: &str) -> Result<(), GatewayError> {
    bot.send_message(ChatId(chat_id), text)
        .await
        .map(|_| ())
        .map_err(map_request_error)
}
