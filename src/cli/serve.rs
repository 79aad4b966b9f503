use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::CommonFlags;
use crate::config::Settings;
use crate::core::control::{ControlPlane, ControlSettings};
use crate::core::gateway::{MessagingGateway, TelegramGateway};
use crate::core::ledger::{LogNotifier, Notifier, TelegramNotifier, UsageLedger};
use crate::core::llm::OpenAiClient;
use crate::core::orchestrator::Orchestrator;
use crate::core::store::ConfigStore;
use crate::core::worker::RuntimeContext;
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging::init_logging;

pub async fn run_serve(flags: CommonFlags) -> Result<()> {
    let log_tx = init_logging(tracing::Level::INFO, false);

    let mut settings = Settings::load(flags.config.as_deref()).await?;
    if let Some(host) = flags.api_host {
        settings.api.host = host;
    }
    if let Some(port) = flags.api_port {
        settings.api.port = port;
    }

    info!("Starting botfactory...");
    let db_path = settings.database_path();
    let store = Arc::new(ConfigStore::open(&db_path, settings.cache_ttl()).await?);
    info!("Store opened at {}", db_path.display());

    let notifier: Arc<dyn Notifier> = match settings.notifier.bot_token.as_deref() {
        Some(token) => Arc::new(TelegramNotifier::new(token)),
        None => {
            warn!("No notifier bot configured; quota notices go to the log only.");
            Arc::new(LogNotifier)
        }
    };
    let ledger = Arc::new(UsageLedger::new(
        store.clone(),
        notifier,
        settings.quota.warning_ratio,
    ));
    if settings.llm.api_key.is_none() {
        warn!("No LLM API key configured; AI replies will fail until one is set.");
    }
    let gateway: Arc<dyn MessagingGateway> =
        Arc::new(TelegramGateway::new(settings.supervisor.poll_timeout_secs));
    let ctx = Arc::new(RuntimeContext {
        store: store.clone(),
        ledger: ledger.clone(),
        gateway: gateway.clone(),
        llm: Arc::new(OpenAiClient::new(
            settings.llm.api_key.clone(),
            &settings.llm.base_url,
            settings.llm_timeout(),
        )?),
        policy: settings.retry_policy(),
    });

    let orchestrator = Arc::new(Orchestrator::new(ctx));
    let report = orchestrator.reconcile().await?;
    for (worker_id, reason) in &report.failed {
        warn!(worker_id, "not started: {}", reason);
    }

    let control = Arc::new(ControlPlane::new(
        store.clone(),
        ledger,
        orchestrator.clone(),
        gateway,
        ControlSettings::from_settings(&settings),
    ));
    let server = ApiServer::new(ApiServerConfig {
        control,
        store,
        log_tx,
        api_host: settings.api.host.clone(),
        api_port: settings.api.port,
        admin_token: settings.api.admin_token.clone(),
    });

    let shutdown = CancellationToken::new();
    let mut server_task = tokio::spawn(server.serve(shutdown.clone()));

    info!(
        "botfactory is running {} worker(s). Press Ctrl+C to stop.",
        report.started.len()
    );
    let server_done = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            false
        }
        joined = &mut server_task => {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("API Server failed: {}", e),
                Err(e) => error!("API Server task ended abnormally: {}", e),
            }
            true
        }
    };
    info!("Shutting down...");

    shutdown.cancel();
    orchestrator.shutdown().await;
    if !server_done {
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("API Server failed: {}", e),
            Err(e) => error!("API Server task ended abnormally: {}", e),
        }
    }
    info!("Goodbye.");
    Ok(())
}
