use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use clinic_core::models::{QueueStatus, TriageLevel};

#[derive(Parser)]
#[command(name = "clinic")]
#[command(about = "Offline-first clinic records and visit queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage patient records
    Patient {
        #[command(subcommand)]
        command: PatientCommands,
    },
    /// Manage the visit queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Replicate with the central server and inspect pending changes
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
}

#[derive(Subcommand)]
pub enum PatientCommands {
    /// Register a patient
    #[command(alias = "new")]
    Add {
        /// Full name
        name: Vec<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Date of birth (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        dob: Option<NaiveDate>,
        #[arg(long, value_enum)]
        gender: Option<Gender>,
    },
    /// List patients
    List {
        /// Number of patients to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a patient record
    Show {
        /// Patient ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a patient record
    Delete {
        /// Patient ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Put a patient in the queue
    Add {
        /// Patient ID or unique ID prefix
        patient: String,
        #[arg(short, long, value_enum, default_value_t = TriageArg::Medium)]
        triage: TriageArg,
        /// Queue date (YYYY-MM-DD, defaults to today)
        #[arg(long, value_name = "DATE")]
        date: Option<NaiveDate>,
    },
    /// Show the queue in the order patients will be seen
    List {
        /// Queue date (YYYY-MM-DD, defaults to today)
        #[arg(long, value_name = "DATE")]
        date: Option<NaiveDate>,
        /// Only entries with this status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change an entry's status
    Status {
        /// Queue entry ID or unique ID prefix
        id: String,
        #[arg(value_enum)]
        status: StatusArg,
    },
    /// Change an entry's triage level
    Triage {
        /// Queue entry ID or unique ID prefix
        id: String,
        #[arg(value_enum)]
        level: TriageArg,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Push pending changes and pull remote ones (the default)
    Run,
    /// Show connectivity and pending change counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List changes waiting for the server
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-queue changes that exhausted their retry budget
    RetryFailed,
    /// Drop a pending change without sending it
    Discard {
        /// Operation ID as shown by `clinic sync pending`
        operation_id: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

impl Gender {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum TriageArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<TriageArg> for TriageLevel {
    fn from(value: TriageArg) -> Self {
        match value {
            TriageArg::Low => Self::Low,
            TriageArg::Medium => Self::Medium,
            TriageArg::High => Self::High,
            TriageArg::Critical => Self::Critical,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StatusArg {
    Waiting,
    InProgress,
    Done,
    Canceled,
}

impl From<StatusArg> for QueueStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Waiting => Self::Waiting,
            StatusArg::InProgress => Self::InProgress,
            StatusArg::Done => Self::Done,
            StatusArg::Canceled => Self::Canceled,
        }
    }
}
