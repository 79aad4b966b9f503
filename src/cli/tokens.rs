use anyhow::Result;
use console::style;

use super::CommonFlags;
use crate::config::Settings;
use crate::core::store::{ConfigStore, TokenScope};
use crate::core::terminal::{print_error, print_info, print_success};

/// Manages admin API tokens directly in the local store.
pub async fn run_token_command(flags: CommonFlags) -> Result<()> {
    let settings = Settings::load(flags.config.as_deref()).await?;
    let store = ConfigStore::open(settings.database_path(), settings.cache_ttl()).await?;

    let read_only = flags.positional.iter().any(|a| a == "--read-only");
    let args: Vec<&str> = flags
        .positional
        .iter()
        .map(String::as_str)
        .filter(|a| !a.starts_with("--"))
        .collect();
    let sub_cmd = args.first().copied().unwrap_or("");
    let argument = args.get(1).copied();

    match sub_cmd {
        "create" => {
            let Some(name) = argument.map(str::trim).filter(|n| !n.is_empty()) else {
                println!(
                    "{}",
                    style("Usage: botfactory token create <name> [--read-only]").bold()
                );
                println!("  Example: botfactory token create ci-deployer");
                return Ok(());
            };
            let scope = if read_only {
                TokenScope::ReadOnly
            } else {
                TokenScope::Admin
            };
            let (raw, record) = store.issue_api_token(name, scope).await?;
            println!();
            print_success(&format!(
                "{} token '{}' created ({}).",
                record.scope.as_str(),
                record.name,
                record.id
            ));
            println!(
                "\n  {} {}\n",
                style("Token:").bold(),
                style(&raw).green().bold()
            );
            println!(
                "  {} Save this token now. It will not be shown again.",
                style("⚠").yellow()
            );
            println!(
                "  {} Use it with: Authorization: Bearer {}\n",
                style("→").cyan(),
                raw
            );
        }
        "list" | "ls" => {
            let tokens = store.list_api_tokens().await?;
            if tokens.is_empty() {
                print_info("No API tokens. The API is open on loopback addresses only.");
                return Ok(());
            }
            println!(
                "\n  {:<38} {:<20} {:<10} {:<20} {}",
                style("ID").bold(),
                style("NAME").bold(),
                style("SCOPE").bold(),
                style("CREATED").bold(),
                style("LAST USED").bold()
            );
            for token in tokens {
                println!(
                    "  {:<38} {:<20} {:<10} {:<20} {}",
                    token.id,
                    token.name,
                    token.scope.as_str(),
                    token.created_at,
                    token.last_used_at.as_deref().unwrap_or("never")
                );
            }
            println!();
        }
        "revoke" | "delete" | "rm" => {
            let Some(id) = argument else {
                println!("{}", style("Usage: botfactory token revoke <id>").bold());
                return Ok(());
            };
            if store.revoke_api_token(id).await? {
                print_success(&format!("Token {} revoked.", id));
            } else {
                print_error(&format!("Token {} not found.", id));
            }
        }
        _ => {
            println!(
                "{}",
                style("Usage: botfactory token <create|list|revoke> ...").bold()
            );
        }
    }
    Ok(())
}
