//! In-crate doubles for the gateway and LLM, shared by unit tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::Settings;
use crate::core::control::{ControlPlane, ControlSettings};
use crate::core::gateway::{
    BotIdentity, GatewayError, GatewaySession, InboundEvent, MessagingGateway,
};
use crate::core::ledger::{LogNotifier, UsageLedger};
use crate::core::llm::{ChatMessage, Completion, LlmClient, LlmError};
use crate::core::orchestrator::Orchestrator;
use crate::core::store::{ConfigPatch, ConfigStore, NewWorker, OpenAiSettings, test_store};
use crate::core::worker::{RetryPolicy, RuntimeContext};

/// Rejects credentials containing "bad"; every other one is `@fleet_bot`.
/// Sessions idle until closed.
pub(crate) struct IdleGateway {
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

struct IdleSession {
    closed: Arc<AtomicUsize>,
    open: bool,
}

#[async_trait]
impl MessagingGateway for IdleGateway {
    async fn authenticate(&self, credential: &str) -> Result<BotIdentity, GatewayError> {
        if !credential.contains("bad") {
            Ok(BotIdentity {
                id: 1,
                username: "fleet_bot".into(),
            })
        } else {
            Err(GatewayError::Unauthorized("rejected".into()))
        }
    }

    async fn open_session(
        &self,
        _credential: &str,
    ) -> Result<Box<dyn GatewaySession>, GatewayError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(IdleSession {
            closed: self.closed.clone(),
            open: true,
        }))
    }
}

#[async_trait]
impl GatewaySession for IdleSession {
    async fn poll(&mut self) -> Result<Vec<InboundEvent>, GatewayError> {
        if !self.open {
            return Err(GatewayError::Closed);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Vec::new())
    }

    async fn send_text(&self, _chat_id: i64, _text: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn is_member(&self, _channel: &str, _user_id: i64) -> Result<bool, GatewayError> {
        Ok(true)
    }

    async fn approve_join(&self, _chat_id: i64, _user_id: i64) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct SilentLlm;

#[async_trait]
impl LlmClient for SilentLlm {
    async fn complete(
        &self,
        _settings: &OpenAiSettings,
        _messages: &[ChatMessage],
    ) -> Result<Completion, LlmError> {
        Err(LlmError::EmptyResponse)
    }
}

pub(crate) struct Fixture {
    pub store: Arc<ConfigStore>,
    pub gateway: Arc<IdleGateway>,
    pub orchestrator: Arc<Orchestrator>,
    pub control: Arc<ControlPlane>,
}

pub(crate) fn fixture() -> Fixture {
    let store = Arc::new(test_store());
    let gateway = Arc::new(IdleGateway {
        opened: AtomicUsize::new(0),
        closed: Arc::new(AtomicUsize::new(0)),
    });
    let ledger = Arc::new(UsageLedger::new(store.clone(), Arc::new(LogNotifier), 0.9));
    let ctx = Arc::new(RuntimeContext {
        store: store.clone(),
        ledger,
        gateway: gateway.clone(),
        llm: Arc::new(SilentLlm),
        policy: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        },
    });
    let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
    let mut settings = ControlSettings::from_settings(&Settings::default());
    settings.verify_max_wait = Duration::from_millis(200);
    let control = Arc::new(ControlPlane::new(
        store.clone(),
        ctx.ledger.clone(),
        orchestrator.clone(),
        gateway.clone(),
        settings,
    ));
    Fixture {
        store,
        gateway,
        orchestrator,
        control,
    }
}

pub(crate) async fn seed_worker(store: &ConfigStore, credential: &str) -> i64 {
    store.ensure_owner(7, 1_000, None).await.unwrap();
    let (worker, _) = store
        .create_worker(
            NewWorker {
                owner_id: 7,
                credential: credential.to_string(),
                username: "fleet_bot".to_string(),
            },
            &ConfigPatch::default(),
        )
        .await
        .unwrap();
    worker.id
}
