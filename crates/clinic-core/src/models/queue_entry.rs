//! Visit queue entry model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Document, Fields};
use crate::error::{Error, Result};

/// Collection name queue entries are stored under
pub const QUEUE_COLLECTION: &str = "queue";

/// Clinical urgency classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageLevel {
    Low,
    Medium,
    High,
    Critical,
    /// Any level this client does not know; ranks like `medium`
    #[serde(other)]
    Unknown,
}

impl TriageLevel {
    /// Urgency weight; higher is seen first
    pub const fn weight(self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium | Self::Unknown => 2,
            Self::Low => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

/// Visit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    InProgress,
    Done,
    Canceled,
}

impl QueueStatus {
    /// Position in the fixed status order `waiting < in_progress < done < canceled`
    pub const fn rank(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::InProgress => 1,
            Self::Done => 2,
            Self::Canceled => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Canceled => "canceled",
        }
    }
}

/// A patient's place in the day's visit queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    pub patient_id: String,
    /// Unique within `queue_date`
    pub token_number: i64,
    pub triage_level: TriageLevel,
    pub status: QueueStatus,
    pub queue_date: NaiveDate,
    /// Arrival time (Unix ms)
    pub created_at: i64,
}

/// Request to put a patient in the queue; the token is assigned by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQueueEntry {
    pub patient_id: String,
    #[serde(default = "default_triage")]
    pub triage_level: TriageLevel,
    /// Defaults to today's date
    #[serde(default)]
    pub queue_date: Option<NaiveDate>,
}

/// Partial update of an entry; queue entries only change status and triage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryUpdate {
    #[serde(default)]
    pub status: Option<QueueStatus>,
    #[serde(default)]
    pub triage_level: Option<TriageLevel>,
}

const fn default_triage() -> TriageLevel {
    TriageLevel::Medium
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuePayload {
    patient_id: String,
    token_number: i64,
    triage_level: TriageLevel,
    status: QueueStatus,
    queue_date: NaiveDate,
}

impl NewQueueEntry {
    #[must_use]
    pub fn new(patient_id: impl Into<String>, triage_level: TriageLevel) -> Self {
        Self {
            patient_id: patient_id.into(),
            triage_level,
            queue_date: None,
        }
    }

    #[must_use]
    pub const fn on(mut self, queue_date: NaiveDate) -> Self {
        self.queue_date = Some(queue_date);
        self
    }

    /// Date the entry is queued for, defaulting to the local calendar day
    pub fn resolved_date(&self) -> NaiveDate {
        self.queue_date
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    /// Build the queue document for this request with the given token
    pub fn into_document(self, token_number: i64) -> Document {
        let queue_date = self.resolved_date();
        let mut fields = Fields::new();
        fields.insert("patientId".into(), Value::from(self.patient_id));
        fields.insert("tokenNumber".into(), Value::from(token_number));
        fields.insert(
            "triageLevel".into(),
            Value::from(self.triage_level.as_str()),
        );
        fields.insert("status".into(), Value::from(QueueStatus::Waiting.as_str()));
        fields.insert("queueDate".into(), Value::from(format_date(queue_date)));
        Document::new(QUEUE_COLLECTION, fields)
    }
}

impl QueueEntryUpdate {
    /// Apply this update onto a queue document's payload
    pub fn apply(&self, doc: &mut Document) {
        if let Some(status) = self.status {
            doc.fields
                .insert("status".into(), Value::from(status.as_str()));
        }
        if let Some(level) = self.triage_level {
            doc.fields
                .insert("triageLevel".into(), Value::from(level.as_str()));
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.status.is_none() && self.triage_level.is_none()
    }
}

impl QueueEntry {
    /// Project a stored queue document into a typed entry
    pub fn from_document(doc: &Document) -> Result<Self> {
        if doc.collection != QUEUE_COLLECTION {
            return Err(Error::InvalidInput(format!(
                "document {} is not a queue entry",
                doc.id
            )));
        }
        let payload: QueuePayload = serde_json::from_value(Value::Object(doc.fields.clone()))?;
        Ok(Self {
            id: doc.id.clone(),
            patient_id: payload.patient_id,
            token_number: payload.token_number,
            triage_level: payload.triage_level,
            status: payload.status,
            queue_date: payload.queue_date,
            created_at: doc.created_at.unwrap_or_default(),
        })
    }
}

/// Render a queue date the way it is stored (`YYYY-MM-DD`)
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
