use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::checkpoint::{JsonQueueStore, JsonWatermarkStore};
use crate::core::config::OracleConfig;
use crate::core::oracle::{Oracle, OracleContext, read_status};
use crate::core::terminal::{self, Tone};
use crate::core::timing::{Clock, SystemClock};
use crate::logging;

fn print_help() {
    terminal::print_banner();

    terminal::heading("Commands");
    terminal::field("run", "Start the oracle (catch-up, retries, live events)");
    terminal::field("status", "Show the watermark and retry queue");
    terminal::field("help", "Show this message");

    println!(
        "\n {} {} <command> [--config <path>]\n",
        style("Usage:").bold(),
        style("chat-oracle").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandArgs {
    pub config: Option<PathBuf>,
}

pub fn parse_command_args(args: &[String], start: usize) -> CommandArgs {
    let mut parsed = CommandArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    parsed
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    dispatch(&args).await
}

pub async fn dispatch(args: &[String]) -> Result<()> {
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    let parsed = parse_command_args(args, 2);

    match cmd {
        "run" => run_oracle(parsed).await,
        "status" => show_status(parsed).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown command '{}'", other)
        }
    }
}

async fn run_oracle(args: CommandArgs) -> Result<()> {
    let config = OracleConfig::load(args.config.as_deref()).await?;
    logging::init(&config.log_level, config.log_file.as_deref())?;
    config.validate()?;
    tokio::fs::create_dir_all(&config.state_dir).await?;

    terminal::heading("Starting chat-oracle");
    terminal::field("RPC", &config.chain.rpc_url);
    terminal::field("State", &config.state_dir.display().to_string());

    let oracle = Oracle::new(OracleContext::from_config(&config)?);
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            on_signal.cancel();
        }
    });

    oracle.run(cancel).await
}

async fn show_status(args: CommandArgs) -> Result<()> {
    let config = OracleConfig::load(args.config.as_deref()).await?;
    let status = read_status(
        &JsonWatermarkStore::new(config.watermark_path()),
        &JsonQueueStore::new(config.retry_queue_path()),
        &SystemClock,
    )
    .await?;

    let now = SystemClock.now_ms();
    terminal::heading("chat-oracle status");
    terminal::field(
        "Watermark",
        &terminal::describe_watermark(status.watermark.as_ref()),
    );
    terminal::field(
        "Retry queue",
        &format!("{} queued, {} due", status.queued.len(), status.due),
    );
    for job in &status.queued {
        println!("    {}", terminal::describe_job(job, now));
    }

    if status.queued.is_empty() {
        terminal::say(Tone::Ok, "Nothing waiting for retry");
    } else if status.due > 0 {
        terminal::say(Tone::Warn, "Some jobs are due; they run on the next drain");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_flag_is_parsed() {
        let parsed = parse_command_args(&args(&["oracle", "run", "--config", "oracle.toml"]), 2);
        assert_eq!(parsed.config, Some(PathBuf::from("oracle.toml")));
        let short = parse_command_args(&args(&["oracle", "status", "-c", "a.toml"]), 2);
        assert_eq!(short.config, Some(PathBuf::from("a.toml")));
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let err = dispatch(&args(&["oracle", "serve"])).await.unwrap_err();
        assert!(err.to_string().contains("serve"));
        assert!(dispatch(&args(&["oracle", "help"])).await.is_ok());
    }

    #[test]
    fn dangling_flag_is_ignored() {
        let parsed = parse_command_args(&args(&["oracle", "run", "--config"]), 2);
        assert_eq!(parsed, CommandArgs::default());
    }
}
