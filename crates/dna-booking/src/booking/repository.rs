use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Appointment, AppointmentId, AppointmentStatus, AuditEntry, CaseId, Kit, KitId, Payment,
    PaymentId, PaymentStatus, PaymentTarget, Reservation, ReservationId, ReservationStatus, Sample,
    SampleId, SampleStatus, SlotId, StaffId, StaffMember,
};

/// Error enumeration for storage failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Appointment documents. Status changes go through `compare_and_set_status` so two
/// requests can never both move the same appointment out of one status. Every other
/// write touches only its own fields.
pub trait AppointmentRepository: Send + Sync {
    fn insert(&self, appointment: Appointment) -> Result<Appointment, RepositoryError>;
    fn fetch(&self, id: &AppointmentId) -> Result<Option<Appointment>, RepositoryError>;
    /// Sets `next` only if the stored status still equals `expected`; `None` otherwise.
    fn compare_and_set_status(
        &self,
        id: &AppointmentId,
        expected: AppointmentStatus,
        next: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError>;
    /// Binds (or clears) the desk staff member. `slot` replaces the booked slot when
    /// present. `None` when the appointment is already cancelled or completed.
    fn set_staff(
        &self,
        id: &AppointmentId,
        staff: Option<StaffId>,
        slot: Option<SlotId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError>;
    /// Binds (or clears) the laboratory technician; `None` on a terminal appointment.
    fn set_technician(
        &self,
        id: &AppointmentId,
        technician: Option<StaffId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError>;
    /// Live (non-cancelled) appointments bound to `staff` in `slot`.
    fn count_for_staff_in_slot(
        &self,
        staff: &StaffId,
        slot: &SlotId,
    ) -> Result<usize, RepositoryError>;
    /// Increments `amount_paid` and re-derives `payment_stage` in one write. Cancelled and
    /// completed appointments refuse with `Conflict`.
    fn apply_payment(
        &self,
        id: &AppointmentId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Appointment, RepositoryError>;
}

pub trait SampleRepository: Send + Sync {
    fn insert(&self, sample: Sample) -> Result<Sample, RepositoryError>;
    fn fetch(&self, id: &SampleId) -> Result<Option<Sample>, RepositoryError>;
    /// Records the collection date only while the sample is `pending` without one.
    fn set_collection_date(
        &self,
        id: &SampleId,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError>;
    /// Sets `next` only if the stored status still equals `expected`; `received_date` is
    /// stored alongside when present.
    fn compare_and_set_status(
        &self,
        id: &SampleId,
        expected: SampleStatus,
        next: SampleStatus,
        received_date: Option<NaiveDate>,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError>;
    /// `None` when the sample carries no person information.
    fn set_photo_url(
        &self,
        id: &SampleId,
        photo_url: String,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError>;
    fn for_appointment(&self, id: &AppointmentId) -> Result<Vec<Sample>, RepositoryError>;
}

/// The kit pool. Every status change is a single conditional write.
pub trait KitRepository: Send + Sync {
    fn insert(&self, kit: Kit) -> Result<Kit, RepositoryError>;
    fn fetch(&self, id: &KitId) -> Result<Option<Kit>, RepositoryError>;
    /// Up to `limit` available kits ordered by code.
    fn available(&self, limit: usize) -> Result<Vec<Kit>, RepositoryError>;
    /// `available -> assigned`; `false` when the kit was no longer available.
    fn claim(&self, id: &KitId) -> Result<bool, RepositoryError>;
    /// `assigned -> available`.
    fn release(&self, id: &KitId) -> Result<bool, RepositoryError>;
    /// `assigned -> used`.
    fn mark_used(&self, id: &KitId) -> Result<bool, RepositoryError>;
    fn all(&self) -> Result<Vec<Kit>, RepositoryError>;
}

pub trait ReservationRepository: Send + Sync {
    fn insert(&self, reservation: Reservation) -> Result<Reservation, RepositoryError>;
    fn fetch(&self, id: &ReservationId) -> Result<Option<Reservation>, RepositoryError>;
    /// Conditional status write; `converted_to` is stored alongside when present.
    fn compare_and_set_status(
        &self,
        id: &ReservationId,
        expected: ReservationStatus,
        next: ReservationStatus,
        converted_to: Option<AppointmentId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Reservation>, RepositoryError>;
    /// Pending reservations whose hold lapsed at or before `now`.
    fn pending_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, RepositoryError>;
    /// `Conflict` unless the reservation is still pending or confirmed.
    fn apply_payment(
        &self,
        id: &ReservationId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Reservation, RepositoryError>;
}

pub trait PaymentRepository: Send + Sync {
    /// Inserts unless a pending or completed payment already exists for the same
    /// target and stage; returns `false` in that case.
    fn insert_if_none_active(&self, payment: Payment) -> Result<bool, RepositoryError>;
    fn fetch(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError>;
    fn compare_and_set_status(
        &self,
        id: &PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>, RepositoryError>;
    fn for_target(&self, target: &PaymentTarget) -> Result<Vec<Payment>, RepositoryError>;
}

/// Append-only sink for audit history.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log unavailable: {0}")]
    Unavailable(String),
}

/// Outbound notification hook (e-mail adapters and similar).
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub template: String,
    pub recipient: String,
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Links appointments into their parent administrative case.
pub trait CaseRegistry: Send + Sync {
    fn link_appointment(
        &self,
        case: &CaseId,
        appointment: &AppointmentId,
    ) -> Result<(), RepositoryError>;
}

/// Roster lookups for assignment decisions.
pub trait StaffDirectory: Send + Sync {
    fn member(&self, id: &StaffId) -> Result<Option<StaffMember>, RepositoryError>;
    /// Active members rostered on `slot`, in roster order.
    fn roster(&self, slot: &SlotId) -> Result<Vec<StaffMember>, RepositoryError>;
}

/// Every collaborator the engine talks to, shared by the component services.
#[derive(Clone)]
pub struct BookingStores {
    pub appointments: Arc<dyn AppointmentRepository>,
    pub samples: Arc<dyn SampleRepository>,
    pub kits: Arc<dyn KitRepository>,
    pub reservations: Arc<dyn ReservationRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    pub cases: Arc<dyn CaseRegistry>,
    pub staff: Arc<dyn StaffDirectory>,
}
