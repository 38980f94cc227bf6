//! API server command — `phasegate serve`.

use std::sync::Arc;

use anyhow::Result;
use phasegate::api::server::{ServerConfig, start_server};
use phasegate::config::PhasegateConfig;
use phasegate::context::AppContext;

pub async fn cmd_serve(config: PhasegateConfig) -> Result<()> {
    let server = ServerConfig::from_config(&config);
    let ctx = Arc::new(AppContext::open(config)?);
    start_server(ctx, server).await
}
