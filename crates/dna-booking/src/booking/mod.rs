//! Booking engine for DNA-testing appointments: kit pool, sample allocation, appointment
//! lifecycle, staff assignment, staged payments, reservations and audit history.
//!
//! Persistence and the outbound collaborators sit behind the traits in [`repository`];
//! [`memory`] provides mutex-backed implementations used by the API service and tests.

pub mod allocation;
pub mod assignment;
pub mod audit;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod payment;
pub mod policy;
pub mod provisioning;
pub mod repository;
pub mod reservation;
pub mod router;
pub(crate) mod saga;
pub mod service;

#[cfg(test)]
mod tests;

pub use allocation::{AllocationConfig, AllocationRequest, SampleAllocator};
pub use assignment::{AssignmentService, StaffAssignment, StaffCapacityPolicy};
pub use audit::{AuditRecord, AuditTrail, Outcome, SideEffectKind, SideEffectReport};
pub use domain::{
    Appointment, AppointmentId, AppointmentStatus, AppointmentType, AuditEntry, AuditSubject,
    CaseId, CollectionMethod, Kit, KitId, KitStatus, Payment, PaymentId, PaymentMethod,
    PaymentStage, PaymentStageKind, PaymentStatus, PaymentTarget, PersonInfo, Reservation,
    ReservationId, ReservationStatus, Sample, SampleId, SampleStatus, SampleType, SlotId, StaffId,
    StaffMember, StaffRole, UserId,
};
pub use error::{BookingError, ErrorKind, FieldError, StaffSuggestion, ValidationErrors};
pub use lifecycle::{AppointmentLifecycle, NewAdministrativeAppointment, NewAppointment};
pub use memory::{
    MemoryAuditLog, MemoryBackend, MemoryCaseRegistry, MemoryNotifier, MemoryStaffDirectory,
    MemoryStore,
};
pub use payment::{OpenPayment, PaymentDue, PaymentTracker};
pub use policy::{AccessDecision, AccessPolicy, Action, Actor, Role};
pub use provisioning::{import_kits, parse_roster, KitImport, ProvisioningError};
pub use repository::{
    AppointmentRepository, AuditError, AuditSink, BookingStores, CaseRegistry, KitRepository,
    Notification, Notifier, NotifyError, PaymentRepository, RepositoryError,
    ReservationRepository, SampleRepository, StaffDirectory,
};
pub use reservation::{NewReservation, ReservationConfig, ReservationConverter, SweepReport};
pub use router::booking_router;
pub use service::{BookingConfig, BookingService};
