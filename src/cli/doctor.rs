use anyhow::Result;

use super::CommonFlags;
use crate::config::Settings;
use crate::core::store::ConfigStore;
use crate::core::terminal::{
    print_error, print_info, print_link, print_status, print_step, print_success, print_warn,
};

/// Validates settings and reports what the store holds.
pub async fn run_doctor(flags: CommonFlags) -> Result<()> {
    print_step("Checking settings...");
    let settings = match Settings::load(flags.config.as_deref()).await {
        Ok(s) => {
            print_success("Settings are valid.");
            s
        }
        Err(e) => {
            print_error(&format!("Settings are invalid: {}", e));
            return Err(e);
        }
    };

    let policy = settings.retry_policy();
    print_status(
        "Supervisor",
        &format!(
            "{} retries, {:?} base delay, {:?} max delay",
            policy.max_retries, policy.base_delay, policy.max_delay
        ),
    );
    print_status(
        "Quota",
        &format!(
            "{} units per owner, warning at {:.0}%",
            settings.quota.default_limit,
            settings.quota.warning_ratio * 100.0
        ),
    );
    print_link(
        "Admin API",
        &format!("http://{}:{}/api", settings.api.host, settings.api.port),
    );

    if settings.llm.api_key.is_some() {
        print_success("LLM API key configured.");
    } else {
        print_warn("No LLM API key configured. AI replies will fail.");
    }
    if settings.notifier.bot_token.is_some() {
        print_success("Notifier bot configured.");
    } else {
        print_info("No notifier bot configured. Quota notices go to the log.");
    }

    println!();
    print_step("Checking store...");
    let db_path = settings.database_path();
    let store = ConfigStore::open(&db_path, settings.cache_ttl()).await?;
    print_success(&format!("Store opened at {}", db_path.display()));

    let counts = store.status_counts().await?;
    if counts.is_empty() {
        print_info("No workers yet.");
    }
    for (status, count) in counts {
        print_status(&status, &count.to_string());
    }

    let has_tokens = store.has_any_api_tokens().await?;
    let loopback = matches!(settings.api.host.as_str(), "127.0.0.1" | "::1" | "localhost");
    if !has_tokens && settings.api.admin_token.is_none() && !loopback {
        print_warn("The API binds a public address but no tokens exist. Every request will be rejected.");
    }
    Ok(())
}
