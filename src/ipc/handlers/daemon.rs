use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};

pub async fn ping(_params: Value, _ctx: &AppContext) -> Result<Value> {
    Ok(json!({ "pong": true }))
}

pub async fn status(_params: Value, ctx: &AppContext) -> Result<Value> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let todos = ctx.store.count().await;
    let log_level = match &ctx.hot_config {
        Some(hot) => hot.read().await.log_level.clone(),
        None => ctx.config.log.clone(),
    };
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
        "todos": todos,
        "port": ctx.config.port,
        "dataDir": ctx.config.data_dir.display().to_string(),
        "logLevel": log_level,
    }))
}
