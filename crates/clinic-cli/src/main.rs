//! clinic - command-line client for offline-first clinic records
//!
//! Every command works against the local database first; `clinic sync`
//! replicates queued changes once a server is reachable.

mod cli;
mod commands;
mod error;

use clap::Parser;

use cli::{Cli, Commands, PatientCommands, QueueCommands, SyncCommands};
use commands::common::{open_workspace, resolve_db_path};
use commands::patient::{
    run_patient_add, run_patient_delete, run_patient_list, run_patient_show, NewPatient,
};
use commands::queue::{run_queue_add, run_queue_list, run_queue_status, run_queue_triage};
use commands::sync::{
    run_sync, run_sync_conflicts, run_sync_discard, run_sync_pending, run_sync_retry_failed,
    run_sync_status,
};
use error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "clinic=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let workspace = open_workspace(&db_path)?;

    match cli.command {
        Commands::Patient { command } => match command {
            PatientCommands::Add {
                name,
                phone,
                email,
                dob,
                gender,
            } => {
                let patient = NewPatient {
                    name: name.join(" "),
                    phone,
                    email,
                    date_of_birth: dob,
                    gender,
                };
                run_patient_add(&workspace, patient).await?;
            }
            PatientCommands::List { limit, json } => {
                run_patient_list(&workspace, limit, json).await?;
            }
            PatientCommands::Show { id, json } => run_patient_show(&workspace, &id, json).await?,
            PatientCommands::Delete { id } => run_patient_delete(&workspace, &id).await?,
        },
        Commands::Queue { command } => match command {
            QueueCommands::Add {
                patient,
                triage,
                date,
            } => run_queue_add(&workspace, &patient, triage.into(), date).await?,
            QueueCommands::List { date, status, json } => {
                run_queue_list(&workspace, date, status.map(Into::into), json).await?;
            }
            QueueCommands::Status { id, status } => {
                run_queue_status(&workspace, &id, status.into()).await?;
            }
            QueueCommands::Triage { id, level } => {
                run_queue_triage(&workspace, &id, level.into()).await?;
            }
        },
        Commands::Sync { command } => match command {
            None | Some(SyncCommands::Run) => run_sync(&workspace).await?,
            Some(SyncCommands::Status { json }) => run_sync_status(&workspace, json).await?,
            Some(SyncCommands::Pending { json }) => run_sync_pending(&workspace, json).await?,
            Some(SyncCommands::Conflicts { limit, json }) => {
                run_sync_conflicts(&workspace, limit, json).await?;
            }
            Some(SyncCommands::RetryFailed) => run_sync_retry_failed(&workspace).await?,
            Some(SyncCommands::Discard { operation_id }) => {
                run_sync_discard(&workspace, &operation_id).await?;
            }
        },
    }

    Ok(())
}
