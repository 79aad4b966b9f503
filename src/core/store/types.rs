use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

/// Consistency requested by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// May be served from the read cache and lag the latest commit.
    Cached,
    /// Bypasses the cache and reflects the latest committed value.
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedStatus {
    Active,
    Error,
    Stopped,
}

impl PersistedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PersistedStatus::Active => "active",
            PersistedStatus::Error => "error",
            PersistedStatus::Stopped => "stopped",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PersistedStatus::Active),
            "error" => Some(PersistedStatus::Error),
            "stopped" => Some(PersistedStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: i64,
    pub owner_id: i64,
    #[serde(skip_serializing)]
    pub credential: String,
    pub username: String,
    pub status: PersistedStatus,
    pub is_running: bool,
    pub error_count: u32,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewWorker {
    pub owner_id: i64,
    pub credential: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            name: String::new(),
            instructions: String::new(),
            temperature: None,
        }
    }
}

/// Which AI agent answers a worker's conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentDescriptor {
    #[default]
    None,
    #[serde(rename = "openai")]
    OpenAi {
        handle: String,
        #[serde(default)]
        settings: OpenAiSettings,
    },
    External {
        platform: String,
        token: String,
    },
}

impl AgentDescriptor {
    pub fn agent_type(&self) -> &'static str {
        match self {
            AgentDescriptor::None => "none",
            AgentDescriptor::OpenAi { .. } => "openai",
            AgentDescriptor::External { .. } => "external",
        }
    }

    /// Only OpenAI agents consume the owner's unit quota.
    pub fn is_metered(&self) -> bool {
        matches!(self, AgentDescriptor::OpenAi { .. })
    }

    pub fn handle(&self) -> &str {
        match self {
            AgentDescriptor::None => "",
            AgentDescriptor::OpenAi { handle, .. } => handle,
            AgentDescriptor::External { token, .. } => token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionGate {
    #[serde(default)]
    pub enabled: bool,
    /// Numeric chat id or `@username` of the channel users must join.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_deny_message")]
    pub deny_message: String,
}

fn default_deny_message() -> String {
    "Please subscribe to the channel to use this bot.".to_string()
}

impl Default for SubscriptionGate {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: None,
            deny_message: default_deny_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigRecord {
    pub worker_id: i64,
    pub welcome_text: String,
    pub goodbye_text: String,
    pub ai_enabled: bool,
    pub agent: AgentDescriptor,
    pub subscription: SubscriptionGate,
    pub revision: i64,
}

impl ConfigRecord {
    pub fn new(worker_id: i64) -> Self {
        Self {
            worker_id,
            welcome_text: String::new(),
            goodbye_text: String::new(),
            ai_enabled: false,
            agent: AgentDescriptor::None,
            subscription: SubscriptionGate::default(),
            revision: 0,
        }
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.ai_enabled {
            if matches!(self.agent, AgentDescriptor::None) {
                return Err(FleetError::InvalidConfig(
                    "ai cannot be enabled without an agent".to_string(),
                ));
            }
            if self.agent.handle().trim().is_empty() {
                return Err(FleetError::InvalidConfig(
                    "ai cannot be enabled with an empty agent handle".to_string(),
                ));
            }
        }
        if let AgentDescriptor::External { platform, .. } = &self.agent
            && platform.trim().is_empty()
        {
            return Err(FleetError::InvalidConfig(
                "external agent requires a platform".to_string(),
            ));
        }
        if self.subscription.enabled
            && self
                .subscription
                .channel
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(FleetError::InvalidConfig(
                "subscription gate requires a channel".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update of a [`ConfigRecord`]. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goodbye_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionGate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_enabled: Option<bool>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self == &ConfigPatch::default()
    }

    pub fn apply(&self, record: &mut ConfigRecord) {
        if let Some(text) = &self.welcome_text {
            record.welcome_text = text.clone();
        }
        if let Some(text) = &self.goodbye_text {
            record.goodbye_text = text.clone();
        }
        if let Some(enabled) = self.ai_enabled {
            record.ai_enabled = enabled;
        }
        if let Some(agent) = &self.agent {
            record.agent = agent.clone();
        }
        if let Some(gate) = &self.subscription {
            record.subscription = gate.clone();
        }
        if let Some(enabled) = self.subscription_enabled {
            record.subscription.enabled = enabled;
        }
    }

    /// True when every field set in this patch has that value in `record`.
    pub fn is_reflected_in(&self, record: &ConfigRecord) -> bool {
        self.welcome_text
            .as_ref()
            .is_none_or(|t| t == &record.welcome_text)
            && self
                .goodbye_text
                .as_ref()
                .is_none_or(|t| t == &record.goodbye_text)
            && self.ai_enabled.is_none_or(|e| e == record.ai_enabled)
            && self.agent.as_ref().is_none_or(|a| a == &record.agent)
            && self.subscription.as_ref().is_none_or(|g| {
                g.channel == record.subscription.channel
                    && g.deny_message == record.subscription.deny_message
            })
            && self
                .subscription_enabled
                .or(self.subscription.as_ref().map(|g| g.enabled))
                .is_none_or(|e| e == record.subscription.enabled)
    }

    /// Fields a running worker only picks up on (re)start.
    pub fn touches_snapshot(&self) -> bool {
        self.welcome_text.is_some() || self.goodbye_text.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub worker_id: i64,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub worker_id: i64,
    pub input_units: i64,
    pub output_units: i64,
    pub total_units: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerAggregate {
    pub owner_id: i64,
    pub total_used: i64,
    pub limit: i64,
    pub warned: bool,
    pub exhausted_notified: bool,
    pub admin_chat_id: Option<i64>,
}

impl OwnerAggregate {
    pub fn remaining(&self) -> i64 {
        (self.limit - self.total_used).max(0)
    }
}

/// What an admin API token may do. Read-only tokens are limited to
/// `GET` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    #[default]
    Admin,
    ReadOnly,
}

impl TokenScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::Admin => "admin",
            TokenScope::ReadOnly => "read_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(TokenScope::Admin),
            "read_only" => Some(TokenScope::ReadOnly),
            _ => None,
        }
    }

    pub fn allows_writes(self) -> bool {
        self == TokenScope::Admin
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiTokenRecord {
    pub id: String,
    pub name: String,
    pub scope: TokenScope,
    pub created_at: String,
    /// Last successful authentication, if any.
    pub last_used_at: Option<String>,
}

/// Per-worker delivery counter bumped by the message handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatCounter {
    WelcomeSent,
    WelcomeBlocked,
    GoodbyeSent,
    GoodbyeBlocked,
    JoinApproved,
    AiReplies,
}

impl StatCounter {
    pub(crate) fn column(self) -> &'static str {
        match self {
            StatCounter::WelcomeSent => "welcome_sent",
            StatCounter::WelcomeBlocked => "welcome_blocked",
            StatCounter::GoodbyeSent => "goodbye_sent",
            StatCounter::GoodbyeBlocked => "goodbye_blocked",
            StatCounter::JoinApproved => "join_approved",
            StatCounter::AiReplies => "ai_replies",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub welcome_sent: i64,
    pub welcome_blocked: i64,
    pub goodbye_sent: i64,
    pub goodbye_blocked: i64,
    pub join_approved: i64,
    pub ai_replies: i64,
    /// When the worker last received an update.
    pub last_activity: Option<String>,
}

impl WorkerStats {
    /// Share of welcome and goodbye deliveries that hit a blocked user.
    pub fn blocked_rate(&self) -> f64 {
        let blocked = self.welcome_blocked + self.goodbye_blocked;
        let attempted = blocked + self.welcome_sent + self.goodbye_sent;
        if attempted == 0 {
            0.0
        } else {
            blocked as f64 / attempted as f64
        }
    }
}
