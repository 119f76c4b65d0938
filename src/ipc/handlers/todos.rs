//! The four store commands. Each handler is a straight pass-through: parse
//! params, call the store, return the full resulting collection.

use crate::AppContext;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct AddParams {
    text: String,
}

#[derive(Deserialize)]
struct IdParams {
    id: i64,
}

pub async fn get(_params: Value, ctx: &AppContext) -> Result<Value> {
    let tasks = ctx.store.list().await;
    Ok(serde_json::to_value(tasks)?)
}

pub async fn add(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: AddParams = serde_json::from_value(params)?;
    let tasks = ctx.store.add(&p.text).await?;
    ctx.broadcaster
        .broadcast("todos.changed", json!({ "count": tasks.len() }));
    Ok(serde_json::to_value(tasks)?)
}

pub async fn toggle(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: IdParams = serde_json::from_value(params)?;
    let tasks = ctx.store.toggle(p.id).await?;
    ctx.broadcaster
        .broadcast("todos.changed", json!({ "count": tasks.len() }));
    Ok(serde_json::to_value(tasks)?)
}

pub async fn delete(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: IdParams = serde_json::from_value(params)?;
    let tasks = ctx.store.delete(p.id).await?;
    ctx.broadcaster
        .broadcast("todos.changed", json!({ "count": tasks.len() }));
    Ok(serde_json::to_value(tasks)?)
}
