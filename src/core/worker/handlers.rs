use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::RuntimeContext;
use crate::core::gateway::{EventKind, GatewayError, GatewaySession, InboundEvent};
use crate::core::llm::ChatMessage;
use crate::core::store::{AgentDescriptor, ConfigRecord, ReadMode, StatCounter, WorkerRecord};
use crate::error::{FleetError, FleetResult};

const QUOTA_EXHAUSTED_REPLY: &str =
    "This bot has used up its AI allowance. Please try again later.";

/// Everything a handler may touch while processing one event.
pub struct HandlerContext<'a> {
    pub worker: &'a WorkerRecord,
    /// Configuration as of the last (re)start.
    pub snapshot: &'a ConfigRecord,
    pub session: &'a dyn GatewaySession,
    pub runtime: &'a RuntimeContext,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, event: &InboundEvent) -> bool;
    async fn handle(&self, cx: &HandlerContext<'_>, event: &InboundEvent) -> FleetResult<()>;
}

/// Routes each event to the first handler that accepts it.
pub struct Dispatcher {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn standard() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Box::new(GreetingHandler));
        dispatcher.register(Box::new(JoinWelcomeHandler));
        dispatcher.register(Box::new(GoodbyeHandler));
        dispatcher.register(Box::new(AiConversationHandler));
        dispatcher
    }

    pub fn register(&mut self, handler: Box<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Handler failures are logged here and never reach the poll loop.
    pub async fn dispatch(&self, cx: &HandlerContext<'_>, event: &InboundEvent) {
        let Some(handler) = self.handlers.iter().find(|h| h.matches(event)) else {
            return;
        };
        if let Err(e) = handler.handle(cx, event).await {
            match &e {
                FleetError::QuotaExceeded { .. } => {
                    warn!(worker_id = cx.worker.id, handler = handler.name(), "{}", e)
                }
                _ => error!(
                    worker_id = cx.worker.id,
                    handler = handler.name(),
                    update_id = event.update_id,
                    "handler failed: {}",
                    e
                ),
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::standard()
    }
}

async fn record(cx: &HandlerContext<'_>, counter: StatCounter) {
    if let Err(e) = cx.runtime.store.record_stat(cx.worker.id, counter).await {
        warn!(worker_id = cx.worker.id, ?counter, "failed to record stat: {}", e);
    }
}

/// Sends `text` and counts the outcome. A recipient who blocked the bot is
/// counted under `blocked` and is not an error.
async fn deliver(
    cx: &HandlerContext<'_>,
    chat_id: i64,
    text: &str,
    sent: StatCounter,
    blocked: StatCounter,
) -> FleetResult<()> {
    let counter = match cx.session.send_text(chat_id, text).await {
        Ok(()) => sent,
        Err(GatewayError::Blocked(reason)) => {
            debug!(worker_id = cx.worker.id, chat_id, "recipient unreachable: {}", reason);
            blocked
        }
        Err(e) => return Err(e.into()),
    };
    record(cx, counter).await;
    Ok(())
}

/// Replies to `/start` with the welcome text from the snapshot.
pub struct GreetingHandler;

#[async_trait]
impl EventHandler for GreetingHandler {
    fn name(&self) -> &'static str {
        "greeting"
    }

    fn matches(&self, event: &InboundEvent) -> bool {
        event.is_private && event.is_command("/start")
    }

    async fn handle(&self, cx: &HandlerContext<'_>, event: &InboundEvent) -> FleetResult<()> {
        if cx.snapshot.welcome_text.is_empty() {
            return Ok(());
        }
        deliver(
            cx,
            event.chat_id,
            &cx.snapshot.welcome_text,
            StatCounter::WelcomeSent,
            StatCounter::WelcomeBlocked,
        )
        .await
    }
}

/// Admits join requests to an administered chat and welcomes new members
/// privately with the snapshot's welcome text.
pub struct JoinWelcomeHandler;

#[async_trait]
impl EventHandler for JoinWelcomeHandler {
    fn name(&self) -> &'static str {
        "join_welcome"
    }

    fn matches(&self, event: &InboundEvent) -> bool {
        matches!(event.kind, EventKind::MemberJoined | EventKind::JoinRequest)
    }

    async fn handle(&self, cx: &HandlerContext<'_>, event: &InboundEvent) -> FleetResult<()> {
        if event.kind == EventKind::JoinRequest {
            cx.session.approve_join(event.chat_id, event.user_id).await?;
            record(cx, StatCounter::JoinApproved).await;
        }
        if cx.snapshot.welcome_text.is_empty() {
            return Ok(());
        }
        deliver(
            cx,
            event.user_id,
            &cx.snapshot.welcome_text,
            StatCounter::WelcomeSent,
            StatCounter::WelcomeBlocked,
        )
        .await
    }
}

/// Sends the goodbye text to users who left an administered chat.
pub struct GoodbyeHandler;

#[async_trait]
impl EventHandler for GoodbyeHandler {
    fn name(&self) -> &'static str {
        "goodbye"
    }

    fn matches(&self, event: &InboundEvent) -> bool {
        event.kind == EventKind::MemberLeft
    }

    async fn handle(&self, cx: &HandlerContext<'_>, event: &InboundEvent) -> FleetResult<()> {
        if cx.snapshot.goodbye_text.is_empty() {
            return Ok(());
        }
        deliver(
            cx,
            event.user_id,
            &cx.snapshot.goodbye_text,
            StatCounter::GoodbyeSent,
            StatCounter::GoodbyeBlocked,
        )
        .await
    }
}

/// Answers private text messages through the configured AI agent.
///
/// The AI toggle, agent and subscription gate are read fresh on every
/// message; a stale snapshot must never enable a metered call.
pub struct AiConversationHandler;

#[async_trait]
impl EventHandler for AiConversationHandler {
    fn name(&self) -> &'static str {
        "ai_conversation"
    }

    fn matches(&self, event: &InboundEvent) -> bool {
        event.is_private && event.text().is_some_and(|t| !t.starts_with('/') && !t.trim().is_empty())
    }

    async fn handle(&self, cx: &HandlerContext<'_>, event: &InboundEvent) -> FleetResult<()> {
        let Some(text) = event.text() else {
            return Ok(());
        };
        let worker_id = cx.worker.id;
        let live = cx.runtime.store.read(worker_id, ReadMode::Fresh).await?;
        if !live.ai_enabled {
            return Ok(());
        }

        if live.subscription.enabled
            && let Some(channel) = live.subscription.channel.as_deref()
            && !cx.session.is_member(channel, event.user_id).await?
        {
            cx.session
                .send_text(event.chat_id, &live.subscription.deny_message)
                .await?;
            return Ok(());
        }

        let (handle, settings) = match &live.agent {
            AgentDescriptor::OpenAi { handle, settings } => (handle, settings),
            AgentDescriptor::External { platform, .. } => {
                debug!(worker_id, platform = %platform, "external agent, not answered here");
                return Ok(());
            }
            AgentDescriptor::None => return Ok(()),
        };

        let owner_id = cx.worker.owner_id;
        let ledger = &cx.runtime.ledger;
        let quota = ledger.check_quota(owner_id).await?;
        if !quota.allowed {
            ledger.notify_if_threshold(owner_id).await?;
            cx.session
                .send_text(event.chat_id, QUOTA_EXHAUSTED_REPLY)
                .await?;
            return Err(FleetError::QuotaExceeded {
                owner_id,
                used: quota.used,
                limit: quota.limit,
            });
        }

        let mut messages = Vec::with_capacity(2);
        if !settings.instructions.is_empty() {
            messages.push(ChatMessage::system(&settings.instructions));
        }
        messages.push(ChatMessage::user(text));

        let completion = cx.runtime.llm.complete(settings, &messages).await?;
        let charged = ledger
            .charge(worker_id, completion.input_units, completion.output_units)
            .await?;
        ledger.notify_if_threshold(owner_id).await?;
        debug!(
            worker_id,
            agent = %handle,
            owner_total = charged.owner_total,
            "ai reply charged"
        );

        cx.session.send_text(event.chat_id, &completion.text).await?;
        record(cx, StatCounter::AiReplies).await;
        Ok(())
    }
}
