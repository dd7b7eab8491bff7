use std::path::Path;

use anyhow::{Context, Result};

use {
    threadrelay_config::database_path,
    threadrelay_core::{DeliveryOutcome, OutcomeLog},
    threadrelay_store::SqliteOutcomeLog,
};

use crate::relay;

pub async fn show(config: Option<&Path>, limit: u32, origin: Option<i64>, json: bool) -> Result<()> {
    let config = relay::load(config)?;
    let path = database_path(&config);
    if !path.exists() {
        eprintln!("No database at {}; nothing relayed yet.", path.display());
        return Ok(());
    }

    let db = threadrelay_store::open(&path)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    let log = SqliteOutcomeLog::new(db.clone());
    let outcomes = match origin {
        Some(origin) => log.list_by_origin(origin, limit).await?,
        None => log.recent(limit).await?,
    };
    db.close().await;

    if outcomes.is_empty() {
        println!("No delivery outcomes recorded.");
        return Ok(());
    }
    for outcome in &outcomes {
        if json {
            println!("{}", serde_json::to_string(outcome)?);
        } else {
            println!("{}", format_row(outcome));
        }
    }
    Ok(())
}

fn format_row(outcome: &DeliveryOutcome) -> String {
    let destination = match outcome.destination_message_id {
        Some(id) => format!("{}/{id}", outcome.destination_chat_id),
        None => format!("{}/-", outcome.destination_chat_id),
    };
    let mut row = format!(
        "{}  {}/{} -> {destination}  {:<18} {}",
        outcome.timestamp.format("%Y-%m-%d %H:%M:%S"),
        outcome.origin_chat_id,
        outcome.message_id,
        outcome.strategy.as_str(),
        outcome.status.as_str(),
    );
    if let Some(detail) = &outcome.detail {
        row.push_str(&format!("  ({detail})"));
    }
    row
}
