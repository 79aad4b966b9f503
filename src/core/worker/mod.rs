mod backoff;
mod handlers;
mod lifecycle;
mod runtime;

use std::sync::Arc;

use crate::core::gateway::MessagingGateway;
use crate::core::ledger::UsageLedger;
use crate::core::llm::LlmClient;
use crate::core::store::ConfigStore;

pub use backoff::RetryPolicy;
pub use handlers::{
    AiConversationHandler, Dispatcher, EventHandler, GoodbyeHandler, GreetingHandler,
    HandlerContext,
};
pub use lifecycle::{LifecycleState, RuntimeStatus, StateCell, TransitionEvent, can_transition};
pub use runtime::{RunOutcome, WorkerRuntime};

/// Collaborators shared by every worker runtime.
pub struct RuntimeContext {
    pub store: Arc<ConfigStore>,
    pub ledger: Arc<UsageLedger>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub llm: Arc<dyn LlmClient>,
    pub policy: RetryPolicy,
}
