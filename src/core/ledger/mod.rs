mod notifier;

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::core::store::{ConfigStore, OwnerAggregate, ReadMode, UsageRecord};
use crate::error::{FleetError, FleetResult};

pub use notifier::{LogNotifier, Notifier, TelegramNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdNotice {
    Warning,
    Exhausted,
}

impl ThresholdNotice {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdNotice::Warning => "warning",
            ThresholdNotice::Exhausted => "exhausted",
        }
    }

    pub fn message(self, owner: &OwnerAggregate) -> String {
        match self {
            ThresholdNotice::Warning => format!(
                "Heads up: your bots have used {} of {} units. {} units remain.",
                owner.total_used,
                owner.limit,
                owner.remaining()
            ),
            ThresholdNotice::Exhausted => format!(
                "Your unit limit of {} is used up ({} used). AI replies are paused until the limit is raised.",
                owner.limit, owner.total_used
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChargeOutcome {
    pub usage: UsageRecord,
    pub owner_total: i64,
    pub within_limit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub remaining: i64,
    pub used: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub aggregate: OwnerAggregate,
    pub workers: Vec<UsageRecord>,
}

/// Per-worker usage counters and the owner-level quota derived from them.
///
/// `check_quota` followed by `charge` is not atomic across workers of the
/// same owner; two workers may both pass the check and overshoot the limit
/// by one unit of work each.
pub struct UsageLedger {
    store: Arc<ConfigStore>,
    notifier: Arc<dyn Notifier>,
    warning_ratio: f64,
}

impl UsageLedger {
    pub fn new(store: Arc<ConfigStore>, notifier: Arc<dyn Notifier>, warning_ratio: f64) -> Self {
        Self {
            store,
            notifier,
            warning_ratio,
        }
    }

    pub async fn charge(
        &self,
        worker_id: i64,
        input_units: i64,
        output_units: i64,
    ) -> FleetResult<ChargeOutcome> {
        if input_units < 0 || output_units < 0 {
            return Err(FleetError::InvalidConfig(format!(
                "negative usage ({input_units}, {output_units})"
            )));
        }
        let (usage, aggregate) = self
            .store
            .apply_charge(worker_id, input_units, output_units)
            .await?;
        debug!(
            worker_id,
            owner_id = aggregate.owner_id,
            owner_total = aggregate.total_used,
            "usage charged"
        );
        Ok(ChargeOutcome {
            usage,
            owner_total: aggregate.total_used,
            within_limit: aggregate.total_used < aggregate.limit,
        })
    }

    pub async fn check_quota(&self, owner_id: i64) -> FleetResult<QuotaStatus> {
        let aggregate = self.store.owner_aggregate(owner_id, ReadMode::Fresh).await?;
        Ok(QuotaStatus {
            allowed: aggregate.total_used < aggregate.limit,
            remaining: aggregate.remaining(),
            used: aggregate.total_used,
            limit: aggregate.limit,
        })
    }

    /// Sends the warning (at the configured ratio) or hard-stop notice (at
    /// 100%) if it has not been sent for this owner yet. Returns the notice
    /// this call claimed, if any.
    pub async fn notify_if_threshold(&self, owner_id: i64) -> FleetResult<Option<ThresholdNotice>> {
        let aggregate = self.store.owner_aggregate(owner_id, ReadMode::Fresh).await?;

        let notice = if aggregate.total_used >= aggregate.limit {
            if !self.store.claim_exhausted(owner_id).await? {
                return Ok(None);
            }
            ThresholdNotice::Exhausted
        } else if aggregate.total_used as f64 >= aggregate.limit as f64 * self.warning_ratio {
            if !self.store.claim_warning(owner_id).await? {
                return Ok(None);
            }
            ThresholdNotice::Warning
        } else {
            return Ok(None);
        };

        info!(
            owner_id,
            used = aggregate.total_used,
            limit = aggregate.limit,
            "quota {} threshold reached",
            notice.as_str()
        );
        if let Err(e) = self.notifier.notify(&aggregate, notice).await {
            error!(owner_id, "failed to deliver {} notice: {}", notice.as_str(), e);
        }
        Ok(Some(notice))
    }

    pub async fn raise_limit(&self, owner_id: i64, new_limit: i64) -> FleetResult<OwnerAggregate> {
        if new_limit < 0 {
            return Err(FleetError::InvalidConfig(
                "limit must not be negative".to_string(),
            ));
        }
        let aggregate = self.store.set_owner_limit(owner_id, new_limit).await?;
        info!(owner_id, limit = new_limit, "owner limit updated");
        Ok(aggregate)
    }

    pub async fn report(&self, owner_id: i64) -> FleetResult<UsageReport> {
        Ok(UsageReport {
            aggregate: self.store.owner_aggregate(owner_id, ReadMode::Fresh).await?,
            workers: self.store.usage_for_owner(owner_id).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gateway::GatewayError;
    use crate::core::store::{AgentDescriptor, ConfigPatch, NewWorker, OpenAiSettings, test_store};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(i64, ThresholdNotice)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(
            &self,
            owner: &OwnerAggregate,
            notice: ThresholdNotice,
        ) -> Result<(), GatewayError> {
            self.sent.lock().await.push((owner.owner_id, notice));
            Ok(())
        }
    }

    async fn ledger_with_worker(limit: i64) -> (UsageLedger, Arc<Recording>, i64) {
        let store = Arc::new(test_store());
        store.ensure_owner(1, limit, Some(100)).await.unwrap();
        let (w, _) = store
            .create_worker(
                NewWorker {
                    owner_id: 1,
                    credential: "1:x".into(),
                    username: "x".into(),
                },
                &ConfigPatch {
                    ai_enabled: Some(true),
                    agent: Some(AgentDescriptor::OpenAi {
                        handle: "asst".into(),
                        settings: OpenAiSettings::default(),
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let recording = Arc::new(Recording::default());
        let ledger = UsageLedger::new(store, recording.clone(), 0.9);
        (ledger, recording, w.id)
    }

    #[tokio::test]
    async fn warning_fires_once_at_ninety_percent() {
        let (ledger, rec, w) = ledger_with_worker(1000).await;
        ledger.charge(w, 500, 300).await.unwrap();
        assert_eq!(ledger.notify_if_threshold(1).await.unwrap(), None);

        ledger.charge(w, 100, 0).await.unwrap();
        assert_eq!(
            ledger.notify_if_threshold(1).await.unwrap(),
            Some(ThresholdNotice::Warning)
        );
        ledger.charge(w, 10, 0).await.unwrap();
        assert_eq!(ledger.notify_if_threshold(1).await.unwrap(), None);
        assert_eq!(rec.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn quota_check_blocks_at_limit() {
        let (ledger, _, w) = ledger_with_worker(100).await;
        ledger.charge(w, 60, 39).await.unwrap();
        let status = ledger.check_quota(1).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);

        let outcome = ledger.charge(w, 1, 0).await.unwrap();
        assert!(!outcome.within_limit);
        let status = ledger.check_quota(1).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn negative_units_are_rejected() {
        let (ledger, _, w) = ledger_with_worker(100).await;
        assert!(matches!(
            ledger.charge(w, -1, 0).await,
            Err(FleetError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn raising_limit_rearms_notices() {
        let (ledger, rec, w) = ledger_with_worker(100).await;
        ledger.charge(w, 100, 0).await.unwrap();
        assert_eq!(
            ledger.notify_if_threshold(1).await.unwrap(),
            Some(ThresholdNotice::Exhausted)
        );
        ledger.raise_limit(1, 105).await.unwrap();
        assert_eq!(
            ledger.notify_if_threshold(1).await.unwrap(),
            Some(ThresholdNotice::Warning)
        );
        assert_eq!(
            *rec.sent.lock().await,
            vec![(1, ThresholdNotice::Exhausted), (1, ThresholdNotice::Warning)]
        );
    }

    #[test]
    fn exhausted_message_mentions_limit() {
        let agg = OwnerAggregate {
            owner_id: 1,
            total_used: 1010,
            limit: 1000,
            warned: true,
            exhausted_notified: true,
            admin_chat_id: None,
        };
        assert!(ThresholdNotice::Exhausted.message(&agg).contains("1000"));
        assert_eq!(agg.remaining(), 0);
    }
}
