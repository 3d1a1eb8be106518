use chrono::{Local, NaiveDate};
use clinic_core::models::{
    NewQueueEntry, QueueEntry, QueueEntryUpdate, QueueStatus, TriageLevel, QUEUE_COLLECTION,
};

use crate::commands::common::{format_queue_lines, resolve_document, short_id, Workspace};
use crate::commands::patient::PATIENTS;
use crate::error::CliError;

/// Queue a known patient; the token is provisional until the server acknowledges it
pub async fn add_to_queue(
    workspace: &Workspace,
    patient: &str,
    triage: TriageLevel,
    date: Option<NaiveDate>,
) -> Result<QueueEntry, CliError> {
    let patient = resolve_document(&workspace.store, PATIENTS, patient).await?;
    let mut entry = NewQueueEntry::new(patient.id, triage);
    if let Some(date) = date {
        entry = entry.on(date);
    }

    let (doc, _) = workspace.store.create_queue_entry(entry).await?;
    Ok(QueueEntry::from_document(&doc)?)
}

pub async fn update_entry(
    workspace: &Workspace,
    id: &str,
    update: QueueEntryUpdate,
) -> Result<QueueEntry, CliError> {
    let doc = resolve_document(&workspace.store, QUEUE_COLLECTION, id).await?;
    let (entry, _) = workspace.store.update_queue_entry(&doc.id, update).await?;
    Ok(entry)
}

pub async fn run_queue_add(
    workspace: &Workspace,
    patient: &str,
    triage: TriageLevel,
    date: Option<NaiveDate>,
) -> Result<(), CliError> {
    let entry = add_to_queue(workspace, patient, triage, date).await?;
    println!(
        "Token #{} for {} ({})",
        entry.token_number,
        entry.queue_date,
        short_id(&entry.id)
    );
    Ok(())
}

pub async fn run_queue_list(
    workspace: &Workspace,
    date: Option<NaiveDate>,
    status: Option<QueueStatus>,
    as_json: bool,
) -> Result<(), CliError> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let entries = workspace.store.queue_entries(Some(date), status).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("Queue for {date} is empty.");
    } else {
        for line in format_queue_lines(&entries) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_queue_status(
    workspace: &Workspace,
    id: &str,
    status: QueueStatus,
) -> Result<(), CliError> {
    let update = QueueEntryUpdate {
        status: Some(status),
        triage_level: None,
    };
    let entry = update_entry(workspace, id, update).await?;
    println!("#{} is now {}", entry.token_number, entry.status.as_str());
    Ok(())
}

pub async fn run_queue_triage(
    workspace: &Workspace,
    id: &str,
    level: TriageLevel,
) -> Result<(), CliError> {
    let update = QueueEntryUpdate {
        status: None,
        triage_level: Some(level),
    };
    let entry = update_entry(workspace, id, update).await?;
    println!("#{} is now {}", entry.token_number, entry.triage_level.as_str());
    Ok(())
}
