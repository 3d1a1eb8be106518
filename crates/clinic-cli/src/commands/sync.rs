use clinic_core::models::OperationId;
use clinic_core::sync::SyncReport;
use clinic_core::SyncStatus;
use serde::Serialize;

use crate::commands::common::{
    format_pending_lines, format_sync_conflict_lines, format_timestamp, normalize_identifier,
    pending_to_item, sync_conflict_to_item, PendingItem, SyncConflictItem, Workspace,
};
use crate::error::CliError;

pub async fn run_sync(workspace: &Workspace) -> Result<(), CliError> {
    let engine = workspace.engine()?;
    if !engine.probe().await {
        let url = workspace.config.server_url.clone().unwrap_or_default();
        return Err(CliError::Unreachable(url));
    }

    let report = engine.sync_now().await?;
    for line in format_sync_report(&report) {
        println!("{line}");
    }

    let status = engine.status().current();
    if status.failed_changes > 0 {
        println!(
            "{} change(s) failed permanently; see `clinic sync pending`",
            status.failed_changes
        );
    }
    Ok(())
}

pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    let pushed = &report.pushed;
    let pulled = &report.pulled;
    vec![
        format!(
            "Pushed: {} acknowledged, {} resolved, {} rejected, {} failed",
            pushed.acknowledged, pushed.resolved, pushed.rejected, pushed.dead_lettered
        ),
        format!(
            "Pulled: {} applied, {} already current, {} conflicts",
            pulled.applied, pulled.skipped, pulled.conflicts
        ),
    ]
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub server_url: Option<String>,
    #[serde(flatten)]
    pub status: SyncStatus,
}

/// Pending counts, plus reachability when a server is configured
pub async fn sync_status(workspace: &Workspace) -> Result<StatusReport, CliError> {
    let status = if workspace.config.is_remote_configured() {
        let engine = workspace.engine()?;
        engine.refresh_pending().await?;
        engine.probe().await;
        engine.status().current()
    } else {
        let queue = workspace.queue();
        SyncStatus {
            pending_changes: queue.pending_count().await?,
            failed_changes: queue.failed_count().await?,
            ..SyncStatus::default()
        }
    };

    Ok(StatusReport {
        server_url: workspace.config.server_url.clone(),
        status,
    })
}

pub async fn run_sync_status(workspace: &Workspace, as_json: bool) -> Result<(), CliError> {
    let report = sync_status(workspace).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let status = &report.status;
    match report.server_url.as_deref() {
        Some(url) if status.is_online => println!("Server: {url} (reachable)"),
        Some(url) => println!("Server: {url} (unreachable)"),
        None => println!("Server: not configured (local only)"),
    }
    println!("Pending changes: {}", status.pending_changes);
    if status.failed_changes > 0 {
        println!("Failed changes: {}", status.failed_changes);
    }
    if let Some(at) = status.last_sync_time {
        println!("Last sync: {}", format_timestamp(at));
    }
    Ok(())
}

pub async fn run_sync_pending(workspace: &Workspace, as_json: bool) -> Result<(), CliError> {
    let operations = workspace.queue().list().await?;

    if as_json {
        let items = operations
            .iter()
            .map(pending_to_item)
            .collect::<Vec<PendingItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("No pending changes.");
        return Ok(());
    }

    for line in format_pending_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_conflicts(
    workspace: &Workspace,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = workspace.store.list_conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_retry_failed(workspace: &Workspace) -> Result<(), CliError> {
    let count = workspace.queue().retry_failed().await?;
    println!("Re-queued {count} failed change(s)");
    Ok(())
}

pub async fn run_sync_discard(workspace: &Workspace, operation_id: &str) -> Result<(), CliError> {
    let raw = normalize_identifier(operation_id)?;
    let id = raw
        .parse::<OperationId>()
        .map_err(|_| CliError::NotFound {
            collection: "pending operation".to_string(),
            query: raw.clone(),
        })?;
    workspace.queue().discard(&id).await?;
    println!("Discarded {raw}");
    Ok(())
}
