//! CSV import of the kit pool and the staff roster.

use std::io::Read;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use super::domain::{next_id, Kit, KitId, KitStatus, SlotId, StaffId, StaffMember, StaffRole};
use super::repository::{KitRepository, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: {message}")]
    InvalidRow { line: u64, message: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KitImport {
    pub added: usize,
    /// Codes already present in the pool or repeated in the file.
    pub duplicates: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KitRow {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    id: Option<String>,
    code: String,
}

/// Load kits (`code` column, optional `id`) into the pool as `available`.
pub fn import_kits<R: Read>(
    reader: R,
    pool: &dyn KitRepository,
) -> Result<KitImport, ProvisioningError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut report = KitImport::default();

    for (index, row) in csv_reader.deserialize::<KitRow>().enumerate() {
        let row = row?;
        let line = index as u64 + 2;
        if row.code.is_empty() {
            return Err(ProvisioningError::InvalidRow {
                line,
                message: "kit code is empty".to_string(),
            });
        }

        let kit = Kit {
            id: KitId(row.id.unwrap_or_else(|| next_id("kit"))),
            code: row.code.clone(),
            status: KitStatus::Available,
        };
        match pool.insert(kit) {
            Ok(kit) => {
                debug!(kit_id = %kit.id, code = %kit.code, "kit provisioned");
                report.added += 1;
            }
            Err(RepositoryError::Conflict) => {
                debug!(line, code = %row.code, "duplicate kit skipped");
                report.duplicates.push(row.code);
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!(
        added = report.added,
        duplicates = report.duplicates.len(),
        "kit pool provisioned"
    );
    Ok(report)
}

#[derive(Debug, Deserialize)]
struct RosterRow {
    id: String,
    name: String,
    role: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    active: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    slots: Option<String>,
}

/// Parse roster rows: `id,name,role,active,slots` where `slots` is `;`-separated.
pub fn parse_roster<R: Read>(reader: R) -> Result<Vec<StaffMember>, ProvisioningError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut members = Vec::new();

    for (index, row) in csv_reader.deserialize::<RosterRow>().enumerate() {
        let row = row?;
        let line = index as u64 + 2;
        let invalid = |message: String| ProvisioningError::InvalidRow { line, message };

        if row.id.is_empty() {
            return Err(invalid("staff id is empty".to_string()));
        }
        let role = parse_staff_role(&row.role)
            .ok_or_else(|| invalid(format!("unknown staff role `{}`", row.role)))?;
        let active = match row.active.as_deref() {
            None => true,
            Some(raw) => parse_flag(raw)
                .ok_or_else(|| invalid(format!("`{raw}` is not a boolean")))?,
        };
        let slots = row
            .slots
            .as_deref()
            .map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|slot| !slot.is_empty())
                    .map(SlotId::from)
                    .collect()
            })
            .unwrap_or_default();

        members.push(StaffMember {
            id: StaffId(row.id),
            name: row.name,
            role,
            active,
            slots,
        });
    }

    Ok(members)
}

fn parse_staff_role(raw: &str) -> Option<StaffRole> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "staff" => Some(StaffRole::Staff),
        "lab_technician" | "laboratory_technician" | "technician" => {
            Some(StaffRole::LabTechnician)
        }
        "manager" => Some(StaffRole::Manager),
        _ => None,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|value| !value.trim().is_empty()))
}
