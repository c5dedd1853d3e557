use anyhow::{Context, Result};
use clap::Parser;
use clicktally::init::init_tracing;
use clicktally::{ClickClassification, Collaborators, RuntimeConfig, Telemetry};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Feed click events from stdin through the telemetry pipeline
#[derive(Parser)]
#[command(name = "clicktally")]
#[command(version)]
#[command(about = "Batch click events from stdin to an ingest endpoint", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Batch-ingest endpoint URL (overrides config file)
    #[arg(short, long, value_name = "URL")]
    endpoint: Option<String>,

    /// User identity that batch ids are derived from
    #[arg(short, long, value_name = "ID")]
    user_id: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// One line of newline-delimited JSON input.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum InputEvent {
    Product { id: String },
    ProductUnderShop { id: String, shop_id: String },
    Shop { id: String },
    Hidden,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load_or_default().context("Failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli);
    config.validate()?;

    init_tracing(&config.logging);

    let collaborators =
        Collaborators::from_config(&config).context("Failed to initialize telemetry")?;
    let telemetry = Telemetry::new(config, collaborators);
    telemetry.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => handle_line(&telemetry, &line).await,
                    None => break,
                }
            }
            _ = &mut interrupt => {
                info!("Interrupted, handing buffer to unload beacon");
                telemetry.on_unload().await;
                telemetry.dispose().await;
                return Ok(());
            }
        }
    }

    telemetry.flush().await;
    telemetry.dispose().await;

    let stats = telemetry.stats();
    info!(
        buffered = stats.buffered_entries,
        circuit = %stats.circuit,
        "Input exhausted"
    );
    Ok(())
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint.url = endpoint.clone();
    }

    if let Some(user_id) = &cli.user_id {
        config.endpoint.user_id = Some(user_id.clone());
    }

    if let Some(level) = &cli.log_level {
        config.logging.log_level = level.clone();
    }
}

async fn handle_line(telemetry: &Telemetry, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<InputEvent>(line) {
        Ok(InputEvent::Product { id }) => {
            telemetry.record_click(&id, None, ClickClassification::Product)
        }
        Ok(InputEvent::ProductUnderShop { id, shop_id }) => {
            telemetry.record_click(&id, Some(&shop_id), ClickClassification::ProductUnderShop)
        }
        Ok(InputEvent::Shop { id }) => telemetry.record_shop_click(&id),
        Ok(InputEvent::Hidden) => telemetry.on_hidden().await,
        Err(e) => warn!(error = %e, "Skipping malformed input line"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_events() {
        let event: InputEvent =
            serde_json::from_str(r#"{"kind":"product_under_shop","id":"p1","shop_id":"s1"}"#)
                .unwrap();
        assert!(matches!(
            event,
            InputEvent::ProductUnderShop { ref id, ref shop_id } if id == "p1" && shop_id == "s1"
        ));

        let event: InputEvent = serde_json::from_str(r#"{"kind":"hidden"}"#).unwrap();
        assert!(matches!(event, InputEvent::Hidden));

        assert!(serde_json::from_str::<InputEvent>(r#"{"kind":"impression"}"#).is_err());
    }

    #[test]
    fn cli_overrides_take_priority() {
        let cli = Cli::parse_from([
            "clicktally",
            "--endpoint",
            "https://api.example.com/clicks",
            "--user-id",
            "u-42",
            "-v",
            "debug",
        ]);
        let mut config = RuntimeConfig::default();
        apply_cli_overrides(&mut config, &cli);

        assert_eq!(config.endpoint.url, "https://api.example.com/clicks");
        assert_eq!(config.endpoint.user_id.as_deref(), Some("u-42"));
        assert_eq!(config.logging.log_level, "debug");
    }
}
