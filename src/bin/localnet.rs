use std::time::Duration;

use tracing_subscriber::EnvFilter;

use pairbft::net::GossipConfig;
use pairbft::sim::{self, SimConfig};
use pairbft::types::PhaseMode;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = match std::env::var("PAIRBFT_MODE").as_deref() {
        Ok("commit-prepare") => PhaseMode::CommitPrepare,
        _ => PhaseMode::Standard,
    };
    let cfg = SimConfig {
        num_validators: env_or("PAIRBFT_VALIDATORS", 4),
        base_port: env_or("PAIRBFT_BASE_PORT", 26657),
        gossip: GossipConfig {
            epoch: Duration::from_millis(env_or("PAIRBFT_EPOCH_MS", 100)),
            branch_factor: env_or("PAIRBFT_BRANCH_FACTOR", 2),
            ..GossipConfig::default()
        },
        run_epochs: env_or("PAIRBFT_RUN_EPOCHS", 50),
        mode,
    };

    let validators = sim::run(cfg).await?;
    for v in &validators {
        let v = v.lock().unwrap_or_else(|p| p.into_inner());
        println!(
            "validator {}: phase {:?}, height {}, finalized {} block(s)",
            v.id(),
            v.phase(),
            v.height(),
            v.finalized().len()
        );
        for (height, hash) in v.finalized() {
            println!("  block {height}: {}", hex::encode(hash));
        }
    }
    Ok(())
}
