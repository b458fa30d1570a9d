use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a customer-facing booking.
    AppointmentId
);
string_id!(SampleId);
string_id!(
    /// Identifier of a physical kit in the pool (distinct from its printed code).
    KitId
);
string_id!(ReservationId);
string_id!(PaymentId);
string_id!(StaffId);
string_id!(SlotId);
string_id!(
    /// Reference to a government-funded administrative case managed elsewhere.
    CaseId
);
string_id!(UserId);

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id(prefix: &str) -> String {
    let id = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{id:06}")
}

/// Status vocabulary of an appointment, including the administrative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    SampleCollected,
    SampleReceived,
    Testing,
    Completed,
    Cancelled,
    Authorized,
    AwaitingAuthorization,
    ReadyForCollection,
}

impl AppointmentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::SampleCollected => "sample_collected",
            Self::SampleReceived => "sample_received",
            Self::Testing => "testing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Authorized => "authorized",
            Self::AwaitingAuthorization => "awaiting_authorization",
            Self::ReadyForCollection => "ready_for_collection",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Statuses from which a submitted sample moves the appointment to `sample_collected`.
    pub const fn awaits_collection(self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::Authorized | Self::ReadyForCollection
        )
    }

    /// Legal successors in the lifecycle graph.
    pub fn successors(self) -> &'static [AppointmentStatus] {
        use AppointmentStatus::*;
        match self {
            Pending => &[Confirmed, Cancelled],
            Confirmed => &[SampleCollected, Cancelled],
            SampleCollected => &[SampleReceived, Cancelled],
            SampleReceived => &[Testing, Cancelled],
            Testing => &[Completed, Cancelled],
            AwaitingAuthorization => &[Authorized, Cancelled],
            Authorized => &[ReadyForCollection, SampleCollected, Cancelled],
            ReadyForCollection => &[SampleCollected, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the specimens for an appointment are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    SelfCollected,
    Facility,
    Home,
}

impl AppointmentType {
    pub const fn collection_method(self) -> CollectionMethod {
        match self {
            Self::SelfCollected => CollectionMethod::SelfCollected,
            Self::Facility => CollectionMethod::Facility,
            Self::Home => CollectionMethod::Home,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    SelfCollected,
    Facility,
    Home,
}

/// Discrete payment progress derived from the amounts on an appointment or reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStage {
    Unpaid,
    DepositPaid,
    Paid,
    GovernmentFunded,
}

impl PaymentStage {
    pub fn derive(amount_paid: u64, deposit_amount: u64, total_amount: u64) -> Self {
        if amount_paid >= total_amount {
            Self::Paid
        } else if amount_paid >= deposit_amount {
            Self::DepositPaid
        } else {
            Self::Unpaid
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::DepositPaid => "deposit_paid",
            Self::Paid => "paid",
            Self::GovernmentFunded => "government_funded",
        }
    }
}

/// A customer-facing booking aggregating samples, assignments and payment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub customer_id: UserId,
    pub status: AppointmentStatus,
    #[serde(rename = "type")]
    pub kind: AppointmentType,
    pub appointment_date: NaiveDate,
    pub total_amount: u64,
    pub deposit_amount: u64,
    pub amount_paid: u64,
    pub payment_stage: PaymentStage,
    pub staff_id: Option<StaffId>,
    pub laboratory_technician_id: Option<StaffId>,
    pub slot_id: Option<SlotId>,
    pub administrative_case_id: Option<CaseId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn is_government_funded(&self) -> bool {
        self.payment_stage == PaymentStage::GovernmentFunded
    }

    pub fn outstanding_amount(&self) -> u64 {
        self.total_amount.saturating_sub(self.amount_paid)
    }

    pub fn has_assignment(&self) -> bool {
        self.staff_id.is_some() || self.laboratory_technician_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Saliva,
    Blood,
    Hair,
    Other,
}

impl SampleType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "saliva" => Some(Self::Saliva),
            "blood" => Some(Self::Blood),
            "hair" => Some(Self::Hair),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Pending,
    Received,
    Testing,
    Completed,
    Invalid,
}

impl SampleStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Received => "received",
            Self::Testing => "testing",
            Self::Completed => "completed",
            Self::Invalid => "invalid",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Invalid)
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity details of the person a sample was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonInfo {
    pub name: String,
    pub relationship: Option<String>,
    pub identity_document: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

/// One physical specimen bound to exactly one kit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub appointment_id: AppointmentId,
    pub kit_id: KitId,
    #[serde(rename = "type")]
    pub sample_type: SampleType,
    pub collection_method: CollectionMethod,
    pub collection_date: Option<NaiveDate>,
    pub received_date: Option<NaiveDate>,
    pub status: SampleStatus,
    pub person_info: Option<PersonInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitStatus {
    Available,
    Assigned,
    Used,
}

impl KitStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Assigned => "assigned",
            Self::Used => "used",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kit {
    pub id: KitId,
    pub code: String,
    pub status: KitStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
    Converted,
}

impl ReservationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Converted => "converted",
        }
    }

    /// Only live holds take payments.
    pub const fn accepts_payments(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pre-paid hold on an administrative service that later becomes an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub customer_id: UserId,
    pub status: ReservationStatus,
    pub testing_need: String,
    pub preferred_collection_type: AppointmentType,
    pub preferred_date: NaiveDate,
    pub total_amount: u64,
    pub deposit_amount: u64,
    pub amount_paid: u64,
    pub remaining_amount: u64,
    pub payment_status: PaymentStage,
    pub reservation_expires_at: DateTime<Utc>,
    pub converted_appointment_id: Option<AppointmentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Applies a completed payment, keeping `remaining_amount` and `payment_status` derived.
    pub(crate) fn apply_payment(&mut self, amount: u64, at: DateTime<Utc>) {
        self.amount_paid = self.amount_paid.saturating_add(amount).min(self.total_amount);
        self.remaining_amount = self.total_amount - self.amount_paid;
        self.payment_status =
            PaymentStage::derive(self.amount_paid, self.deposit_amount, self.total_amount);
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Completed)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which half of the two-stage split a payment settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStageKind {
    Deposit,
    Remaining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    Card,
    EWallet,
}

/// Ledger owner of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentTarget {
    Appointment(AppointmentId),
    Reservation(ReservationId),
}

impl fmt::Display for PaymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentTarget::Appointment(id) => write!(f, "appointment {id}"),
            PaymentTarget::Reservation(id) => write!(f, "reservation {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub target: PaymentTarget,
    pub amount: u64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub stage: PaymentStageKind,
    pub order_code: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Staff,
    LabTechnician,
    Manager,
}

/// Roster entry resolved through the staff directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: StaffId,
    pub name: String,
    pub role: StaffRole,
    pub active: bool,
    #[serde(default)]
    pub slots: Vec<SlotId>,
}

/// What an audit entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuditSubject {
    Appointment(AppointmentId),
    Sample(SampleId),
    Reservation(ReservationId),
    Payment(PaymentId),
}

/// Immutable history record of a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub subject: AuditSubject,
    pub action: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub actor: UserId,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}
