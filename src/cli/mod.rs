mod doctor;
mod serve;
mod tokens;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Fleet")
        .command("serve", "Reconcile workers and serve the admin API")
        .print();

    GuideSection::new("Access")
        .command(
            "token create <name> [--read-only]",
            "Create an admin API token",
        )
        .command("token list", "List admin API tokens")
        .command("token revoke <id>", "Revoke an admin API token")
        .print();

    GuideSection::new("Diagnostics")
        .command("doctor", "Validate settings and inspect the store")
        .print();

    println!(
        "\n {} {} <command> [--config <path>] [--api-host <host>] [--api-port <port>]\n",
        style("Usage:").bold(),
        style("botfactory").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommonFlags {
    pub config: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    /// Arguments that are not flags, in order.
    pub positional: Vec<String>,
}

pub(crate) fn parse_common_flags(args: &[String], start: usize) -> CommonFlags {
    let mut flags = CommonFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    flags.api_host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-port" => {
                if i + 1 < args.len() {
                    flags.api_port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                flags.positional.push(other.to_string());
                i += 1;
            }
        }
    }
    flags
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("");

    match command {
        "serve" | "run" => serve::run_serve(parse_common_flags(&args, 2)).await,
        "token" | "tokens" => tokens::run_token_command(parse_common_flags(&args, 2)).await,
        "doctor" => doctor::run_doctor(parse_common_flags(&args, 2)).await,
        "" | "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}
