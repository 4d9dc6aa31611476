//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use shoal_store::{
    FindResponse, MemoryService, Params, Record, ServiceEvent, Store, StoreBuilder, StoreConfig,
    StoreUpdate,
};

use crate::StoreArgs;

/// Problems reading a dataset or events file.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: expected a JSON array of objects")]
    NotAnArray { path: String },

    #[error("invalid query: {0}")]
    Query(String),
}

fn diagnostic(e: impl std::fmt::Display) -> miette::Report {
    miette::miette!("{}", e)
}

/// Config from `--config` (or defaults) with flag overrides applied.
pub async fn load_config(args: &StoreArgs) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_path(path).await.map_err(diagnostic)?,
        None => StoreConfig::named("records"),
    };
    if let Some(id_field) = &args.id_field {
        config.id_field = id_field.clone();
    }
    if let Some(temp_id_field) = &args.temp_id_field {
        config.temp_id_field = temp_id_field.clone();
    }
    config.whitelist.extend(args.whitelist.iter().cloned());
    config.validate().map_err(diagnostic)?;
    Ok(config)
}

async fn read_json(path: &Path) -> Result<Value, DataError> {
    let display = path.display().to_string();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DataError::Io {
            path: display.clone(),
            source,
        })?;
    serde_json::from_str(&content).map_err(|source| DataError::Json {
        path: display,
        source,
    })
}

/// Read a JSON array of records.
pub async fn load_records(path: &Path) -> Result<Vec<Record>, DataError> {
    let not_an_array = || DataError::NotAnArray {
        path: path.display().to_string(),
    };
    let Value::Array(items) = read_json(path).await? else {
        return Err(not_an_array());
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(record) => Ok(record),
            _ => Err(not_an_array()),
        })
        .collect()
}

/// Read a JSON array of `{"kind": ..., "record": ...}` events.
pub async fn load_events(path: &Path) -> Result<Vec<ServiceEvent>, DataError> {
    let value = read_json(path).await?;
    serde_json::from_value(value).map_err(|source| DataError::Json {
        path: path.display().to_string(),
        source,
    })
}

pub fn parse_query(query: &str) -> Result<Record, DataError> {
    match serde_json::from_str(query) {
        Ok(Value::Object(query)) => Ok(query),
        Ok(other) => Err(DataError::Query(format!("expected an object, got {other}"))),
        Err(e) => Err(DataError::Query(e.to_string())),
    }
}

fn response_json(response: &FindResponse) -> Value {
    json!({
        "total": response.total,
        "limit": response.limit,
        "skip": response.skip,
        "data": response.data,
    })
}

/// Load a dataset into a local store.
async fn local_store(config: StoreConfig, data: &Path) -> Result<Arc<Store>> {
    let store = StoreBuilder::new(config).build().map_err(diagnostic)?;
    let records = load_records(data).await.map_err(diagnostic)?;
    let loaded = store.add_all(records).map_err(diagnostic)?.len();
    debug!(loaded, "dataset loaded");
    Ok(store)
}

pub async fn run_query(config: StoreConfig, data: &Path, query: &str) -> Result<Value> {
    let store = local_store(config, data).await?;
    let params = Params::from_query(parse_query(query).map_err(diagnostic)?).with_temps();
    let response = store.find_in_store(&params).map_err(diagnostic)?;
    Ok(response_json(&response))
}

pub async fn run_count(config: StoreConfig, data: &Path, query: &str) -> Result<Value> {
    let store = local_store(config, data).await?;
    let params = Params::from_query(parse_query(query).map_err(diagnostic)?).with_temps();
    let total = store.count_in_store(&params).map_err(diagnostic)?;
    Ok(json!({ "total": total }))
}

/// Fetch every page from a paginated service, then rebuild them from the ledger.
pub async fn run_paginate(
    config: StoreConfig,
    data: &Path,
    query: &str,
    page_size: usize,
    max_page_size: usize,
) -> Result<Value> {
    let service = Arc::new(
        MemoryService::with_identity(config.identity()).paginated(page_size, max_page_size),
    );
    service.seed(load_records(data).await.map_err(diagnostic)?);
    let store = StoreBuilder::new(config)
        .service(service.clone())
        .build()
        .map_err(diagnostic)?;
    let base = parse_query(query).map_err(diagnostic)?;

    let mut fetched = Vec::new();
    let mut skip = 0;
    loop {
        let mut page_query = base.clone();
        page_query.insert("$limit".into(), json!(page_size));
        page_query.insert("$skip".into(), json!(skip));
        let params = Params::from_query(page_query);

        let response = store.find(&params).await.map_err(diagnostic)?;
        info!(skip, returned = response.data.len(), total = response.total, "page fetched");
        skip += response.data.len();
        let done = response.data.is_empty() || skip >= response.total;
        fetched.push(params);
        if done {
            break;
        }
    }

    let replayed: Vec<Value> = fetched
        .iter()
        .filter_map(|params| store.find_cached(params))
        .map(|response| response_json(&response))
        .collect();

    Ok(json!({
        "requests": service.calls(shoal_store::Operation::Find),
        "stored": store.items().len(),
        "ledger": store.ledger().snapshot(),
        "pages": replayed,
    }))
}

/// Emit events through an in-memory service and report what the store applied.
pub async fn run_replay(
    mut config: StoreConfig,
    events: &Path,
    debounce_ms: Option<u64>,
    interval_ms: u64,
) -> Result<Value> {
    if debounce_ms.is_some() {
        config.debounce_events_time = debounce_ms;
    }
    let window = Duration::from_millis(config.debounce_events_time.unwrap_or(0));
    let events = load_events(events).await.map_err(diagnostic)?;

    let service = Arc::new(MemoryService::with_identity(config.identity()));
    let store = StoreBuilder::new(config)
        .service(service.clone())
        .build()
        .map_err(diagnostic)?;
    let mut updates = store.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = store
        .start_event_listener(shutdown_rx)
        .ok_or_else(|| miette::miette!("service publishes no events"))?;

    let received = events.len();
    for event in events {
        service.emit(event.kind, event.record);
        if interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }
    tokio::time::sleep(window + Duration::from_millis(20)).await;

    shutdown_tx.send(true).map_err(diagnostic)?;
    listener.await.map_err(diagnostic)?;

    let mut writes = 0;
    while let Ok(update) = updates.try_recv() {
        if matches!(update, StoreUpdate::Stored { .. } | StoreUpdate::Removed { .. }) {
            writes += 1;
        }
    }
    info!(received, writes, "events replayed");

    Ok(json!({
        "received": received,
        "writes": writes,
        "items": store.items().list(),
        "temps": store.temps().list(),
    }))
}
