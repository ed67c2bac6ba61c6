use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use applink_lib::auth::Challenge;
use applink_lib::constants::AUTH_PAYLOAD_SIZE;
use applink_lib::simulator::{LinkSimulator, SimulatorConfig, Step, standard_script};

/// Run a scripted modem/appliance exchange and print it as a capture log.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// How long each side waits for a reply, in milliseconds.
    #[arg(long, default_value_t = 50)]
    ack_timeout_ms: u64,
    /// Delay before the appliance answers, in milliseconds.
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
    /// Unix timestamp of the first log line; defaults to now.
    #[arg(long)]
    epoch: Option<u64>,
    /// Append a further authentication step with this 8-byte challenge (hex).
    #[arg(long, requires = "response")]
    challenge: Option<String>,
    /// Modem answer to `--challenge`, 28 bytes of hex.
    #[arg(long, requires = "challenge")]
    response: Option<String>,
    /// Write the capture log here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn parse_hex(label: &str, text: &str, expected: usize) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("{} is not valid hex", label))?;
    if bytes.len() != expected {
        bail!("{} must be {} bytes, got {}", label, expected, bytes.len());
    }
    Ok(bytes)
}

fn script(cli: &Cli) -> Result<Vec<Step>> {
    let mut steps = standard_script();
    if let (Some(challenge), Some(response)) = (&cli.challenge, &cli.response) {
        let challenge = parse_hex("challenge", challenge, 8)?;
        let response = parse_hex("response", response, AUTH_PAYLOAD_SIZE)?;
        let challenge = Challenge::from_payload(&challenge, 0).context("challenge must be 8 bytes")?;
        steps.push(Step::Authenticate {
            challenge,
            response: Bytes::from(response),
        });
    }
    Ok(steps)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // stdout carries the capture log
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(cli.verbose.tracing_level_filter())
        .with_target(false)
        .without_time()
        .init();

    let steps = script(&cli)?;
    info!(
        "Running {} steps: {}",
        steps.len(),
        steps.iter().map(Step::name).collect::<Vec<_>>().join(", ")
    );

    let simulator = LinkSimulator::new(SimulatorConfig {
        ack_timeout: Duration::from_millis(cli.ack_timeout_ms),
        appliance_latency: Duration::from_millis(cli.latency_ms),
        epoch: cli.epoch,
    });
    let outcome = simulator.run(&steps).await?;

    if outcome.log.missed_acks() > 0 {
        warn!("{} replies missed the {} ms window", outcome.log.missed_acks(), cli.ack_timeout_ms);
    }
    info!(
        "Appliance ended with power={} temperature={} mode={}",
        outcome.appliance.power, outcome.appliance.temperature, outcome.appliance.mode
    );

    let text = outcome.log.render();
    match &cli.output {
        Some(path) => {
            std::fs::write(path, &text).with_context(|| format!("Failed to write capture to {:?}", path))?;
            info!("Wrote {} records to {:?}", outcome.log.records().len(), path);
        }
        None => print!("{}", text),
    }
    Ok(())
}
