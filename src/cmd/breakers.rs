//! Circuit breaker inspection and overrides — `phasegate breakers`.

use anyhow::Result;
use phasegate::breaker::BreakerStatus;
use phasegate::config::PhasegateConfig;
use phasegate::context::AppContext;

use super::super::BreakerCommands;

pub async fn cmd_breakers(config: PhasegateConfig, command: Option<BreakerCommands>) -> Result<()> {
    let ctx = AppContext::open(config)?;

    let (name, open) = match command {
        None => {
            let all = ctx.breakers.all_status().await?;
            if all.is_empty() {
                println!("No circuit breakers recorded yet.");
            }
            for status in all.values() {
                print_status(status);
            }
            return Ok(());
        }
        Some(BreakerCommands::Open { name }) => (name, true),
        Some(BreakerCommands::Close { name }) => (name, false),
    };

    if !ctx.breakers.all_status().await?.contains_key(&name) {
        anyhow::bail!("Unknown circuit breaker: {}", name);
    }
    let breaker = ctx.breakers.get(&name).await?;
    if open {
        breaker.force_open().await;
    } else {
        breaker.force_close().await;
    }
    print_status(&breaker.status().await);
    Ok(())
}

fn print_status(status: &BreakerStatus) {
    println!(
        "{:<24} {:<10} failures={}/{} successes={}/{}",
        status.name,
        status.state,
        status.failure_count,
        status.failure_threshold,
        status.success_count,
        status.success_threshold,
    );
}
