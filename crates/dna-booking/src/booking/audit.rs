use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::domain::{AppointmentId, AuditEntry, AuditSubject, CaseId, UserId};
use super::repository::{AuditSink, CaseRegistry, Notification, Notifier};

/// Auxiliary effect attached to a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    Audit,
    Notification,
    CaseLink,
    KitRelease,
}

/// Result of one best-effort effect; failures are reported, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideEffectReport {
    pub kind: SideEffectKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SideEffectReport {
    pub fn ok(kind: SideEffectKind) -> Self {
        Self { kind, error: None }
    }

    pub fn failed(kind: SideEffectKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Primary result of an operation plus the outcome of its auxiliary effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub value: T,
    pub side_effects: Vec<SideEffectReport>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            side_effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, report: SideEffectReport) -> Self {
        self.side_effects.push(report);
        self
    }

    pub fn extend(&mut self, reports: impl IntoIterator<Item = SideEffectReport>) {
        self.side_effects.extend(reports);
    }

    pub fn failed_effects(&self) -> impl Iterator<Item = &SideEffectReport> {
        self.side_effects.iter().filter(|report| !report.succeeded())
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Builder for a single audit entry.
pub struct AuditRecord {
    entry: AuditEntry,
}

impl AuditRecord {
    pub fn new(
        subject: AuditSubject,
        action: impl Into<String>,
        actor: &UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry: AuditEntry {
                subject,
                action: action.into(),
                from_status: None,
                to_status: None,
                actor: actor.clone(),
                at,
                details: BTreeMap::new(),
            },
        }
    }

    pub fn transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.entry.from_status = Some(from.into());
        self.entry.to_status = Some(to.into());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entry.details.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> AuditEntry {
        self.entry
    }
}

/// Writes audit history and other non-critical side effects, swallowing their failures.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    cases: Arc<dyn CaseRegistry>,
}

impl AuditTrail {
    pub fn new(
        sink: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        cases: Arc<dyn CaseRegistry>,
    ) -> Self {
        Self {
            sink,
            notifier,
            cases,
        }
    }

    pub fn record(&self, record: AuditRecord) -> SideEffectReport {
        let entry = record.build();
        let action = entry.action.clone();
        match self.sink.append(entry) {
            Ok(()) => SideEffectReport::ok(SideEffectKind::Audit),
            Err(err) => {
                warn!(%action, error = %err, "audit write failed; state change kept");
                SideEffectReport::failed(SideEffectKind::Audit, err.to_string())
            }
        }
    }

    pub fn notify(&self, notification: Notification) -> SideEffectReport {
        let template = notification.template.clone();
        match self.notifier.notify(notification) {
            Ok(()) => SideEffectReport::ok(SideEffectKind::Notification),
            Err(err) => {
                warn!(%template, error = %err, "notification dispatch failed");
                SideEffectReport::failed(SideEffectKind::Notification, err.to_string())
            }
        }
    }

    pub fn link_case(&self, case: &CaseId, appointment: &AppointmentId) -> SideEffectReport {
        match self.cases.link_appointment(case, appointment) {
            Ok(()) => SideEffectReport::ok(SideEffectKind::CaseLink),
            Err(err) => {
                warn!(case_id = %case, appointment_id = %appointment, error = %err, "administrative case link failed");
                SideEffectReport::failed(SideEffectKind::CaseLink, err.to_string())
            }
        }
    }
}

pub(crate) fn notification(
    template: &str,
    recipient: impl Into<String>,
    details: impl IntoIterator<Item = (&'static str, String)>,
) -> Notification {
    Notification {
        template: template.to_string(),
        recipient: recipient.into(),
        details: details
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    }
}
