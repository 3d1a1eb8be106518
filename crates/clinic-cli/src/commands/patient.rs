use chrono::{NaiveDate, Utc};
use clinic_core::models::{format_date, Document, Fields, OperationKind};
use clinic_core::store::Query;
use serde::Serialize;
use serde_json::Value;

use crate::cli::Gender;
use crate::commands::common::{
    format_relative_time, preview, resolve_document, short_id, text_field, Workspace,
};
use crate::error::CliError;

pub const PATIENTS: &str = "patients";

#[derive(Debug, Default)]
pub struct NewPatient {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
}

impl NewPatient {
    fn into_fields(self) -> Result<Fields, CliError> {
        let name = self.name.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return Err(CliError::EmptyName);
        }

        let mut fields = Fields::new();
        fields.insert("name".into(), Value::from(name));
        if let Some(phone) = self.phone {
            fields.insert("phone".into(), Value::from(phone.trim()));
        }
        if let Some(email) = self.email {
            fields.insert("email".into(), Value::from(email.trim()));
        }
        if let Some(date) = self.date_of_birth {
            fields.insert("dateOfBirth".into(), Value::from(format_date(date)));
        }
        if let Some(gender) = self.gender {
            fields.insert("gender".into(), Value::from(gender.as_str()));
        }
        Ok(fields)
    }
}

#[derive(Debug, Serialize)]
pub struct PatientListItem {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub updated_at: Option<i64>,
    pub relative_time: String,
}

pub async fn add_patient(workspace: &Workspace, patient: NewPatient) -> Result<Document, CliError> {
    let fields = patient.into_fields()?;
    let (doc, _) = workspace
        .store
        .put_tracked(Document::new(PATIENTS, fields), OperationKind::Create)
        .await?;
    Ok(doc)
}

pub async fn list_patients(workspace: &Workspace, limit: usize) -> Result<Vec<Document>, CliError> {
    let mut patients = workspace
        .store
        .query(&Query::collection(PATIENTS).sort_by("name"))
        .await?;
    patients.truncate(limit);
    Ok(patients)
}

pub fn patient_to_list_item(doc: &Document) -> PatientListItem {
    let now_ms = Utc::now().timestamp_millis();
    let optional = |field: &str| doc.get(field).and_then(Value::as_str).map(str::to_string);

    PatientListItem {
        id: doc.id.clone(),
        name: text_field(doc, "name").to_string(),
        phone: optional("phone"),
        email: optional("email"),
        updated_at: doc.updated_at,
        relative_time: doc
            .timestamp()
            .map_or_else(String::new, |at| format_relative_time(at, now_ms)),
    }
}

pub fn format_patient_lines(patients: &[Document]) -> Vec<String> {
    patients
        .iter()
        .map(|doc| {
            let item = patient_to_list_item(doc);
            format!(
                "{:<13}  {:<30}  {:<16}  {}",
                short_id(&item.id),
                preview(&item.name, 30),
                item.phone.unwrap_or_default(),
                item.relative_time
            )
        })
        .collect()
}

pub async fn run_patient_add(workspace: &Workspace, patient: NewPatient) -> Result<(), CliError> {
    let doc = add_patient(workspace, patient).await?;
    println!("{}", doc.id);
    Ok(())
}

pub async fn run_patient_list(
    workspace: &Workspace,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let patients = list_patients(workspace, limit).await?;

    if as_json {
        let items = patients
            .iter()
            .map(patient_to_list_item)
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if patients.is_empty() {
        println!("No patients recorded.");
    } else {
        for line in format_patient_lines(&patients) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_patient_show(workspace: &Workspace, id: &str, as_json: bool) -> Result<(), CliError> {
    let doc = resolve_document(&workspace.store, PATIENTS, id).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("id: {}", doc.id);
    for (field, value) in &doc.fields {
        match value {
            Value::String(text) => println!("{field}: {text}"),
            other => println!("{field}: {other}"),
        }
    }
    println!("revision: {}", doc.revision);
    Ok(())
}

pub async fn run_patient_delete(workspace: &Workspace, id: &str) -> Result<(), CliError> {
    let doc = resolve_document(&workspace.store, PATIENTS, id).await?;
    workspace.store.delete_tracked(&doc.id).await?;
    println!("Deleted patient {}", short_id(&doc.id));
    Ok(())
}
