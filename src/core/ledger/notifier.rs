use async_trait::async_trait;
use teloxide::Bot;
use tracing::{info, warn};

use super::ThresholdNotice;
use crate::core::gateway::{GatewayError, send_with_bot};
use crate::core::store::OwnerAggregate;

/// Delivers quota notices to an owner.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        owner: &OwnerAggregate,
        notice: ThresholdNotice,
    ) -> Result<(), GatewayError>;
}

/// Writes notices to the log only. Used when no notifier bot is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        owner: &OwnerAggregate,
        notice: ThresholdNotice,
    ) -> Result<(), GatewayError> {
        info!(
            owner_id = owner.owner_id,
            notice = notice.as_str(),
            "{}",
            notice.message(owner)
        );
        Ok(())
    }
}

/// Sends notices from a dedicated bot to the owner's admin chat.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(
        &self,
        owner: &OwnerAggregate,
        notice: ThresholdNotice,
    ) -> Result<(), GatewayError> {
        let Some(chat_id) = owner.admin_chat_id else {
            warn!(
                owner_id = owner.owner_id,
                "owner has no admin chat, {} notice not delivered",
                notice.as_str()
            );
            return Ok(());
        };
        send_with_bot(&self.bot, chat_id, &notice.message(owner)).await
    }
}
