use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::response::Response;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;

use crate::booking::domain::{
    Appointment, AppointmentId, AppointmentStatus, AppointmentType, AuditEntry, Kit, KitId,
    KitStatus, Sample, SampleId, SampleStatus, SlotId, StaffId, StaffMember, StaffRole, UserId,
};
use crate::booking::lifecycle::NewAppointment;
use crate::booking::memory::{MemoryBackend, MemoryStore};
use crate::booking::policy::{Actor, Role};
use crate::booking::repository::{
    AppointmentRepository, AuditError, AuditSink, BookingStores, KitRepository, Notification,
    Notifier, NotifyError, RepositoryError, SampleRepository,
};
use crate::booking::service::{BookingConfig, BookingService};

pub(super) const CUSTOMER: &str = "cus-1";
pub(super) const SLOT: &str = "slot-2030-01-15-am";

pub(super) fn customer() -> Actor {
    Actor::new(CUSTOMER, Role::Customer)
}

pub(super) fn other_customer() -> Actor {
    Actor::new("cus-2", Role::Customer)
}

pub(super) fn staff() -> Actor {
    Actor::new("stf-desk", Role::Staff)
}

pub(super) fn manager() -> Actor {
    Actor::new("mgr-1", Role::Manager)
}

pub(super) fn technician() -> Actor {
    Actor::new("tech-1", Role::LabTechnician)
}

pub(super) fn future_date() -> NaiveDate {
    Utc::now().date_naive() + Duration::days(30)
}

pub(super) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub(super) fn staff_member(id: &str, name: &str, role: StaffRole) -> StaffMember {
    StaffMember {
        id: StaffId::from(id),
        name: name.to_string(),
        role,
        active: true,
        slots: vec![SlotId::from(SLOT)],
    }
}

pub(super) fn new_appointment(total: u64, deposit: u64) -> NewAppointment {
    NewAppointment {
        customer_id: UserId::from(CUSTOMER),
        kind: AppointmentType::Facility,
        appointment_date: future_date(),
        total_amount: total,
        deposit_amount: deposit,
        slot_id: Some(SlotId::from(SLOT)),
    }
}

/// A service over an in-memory backend, with the backend kept for inspection.
pub(super) struct Harness {
    pub(super) backend: MemoryBackend,
    pub(super) service: Arc<BookingService>,
}

pub(super) fn harness() -> Harness {
    harness_with(BookingConfig::default())
}

pub(super) fn harness_with(config: BookingConfig) -> Harness {
    let backend = MemoryBackend::default();
    backend
        .staff
        .add(staff_member("tech-1", "Minh", StaffRole::LabTechnician));
    let service = Arc::new(BookingService::new(backend.stores(), config));
    Harness { backend, service }
}

/// Same as [`harness`] but with some stores swapped out.
pub(super) fn harness_with_stores(
    customize: impl FnOnce(&MemoryBackend, &mut BookingStores),
) -> Harness {
    let backend = MemoryBackend::default();
    backend
        .staff
        .add(staff_member("tech-1", "Minh", StaffRole::LabTechnician));
    let mut stores = backend.stores();
    customize(&backend, &mut stores);
    let service = Arc::new(BookingService::new(stores, BookingConfig::default()));
    Harness { backend, service }
}

impl Harness {
    pub(super) fn add_kits(&self, count: usize) -> Vec<Kit> {
        (1..=count)
            .map(|index| {
                let kit = Kit {
                    id: KitId(format!("kit-{index:04}")),
                    code: format!("KIT-{index:04}"),
                    status: KitStatus::Available,
                };
                KitRepository::insert(self.backend.store.as_ref(), kit).expect("kit inserted")
            })
            .collect()
    }

    pub(super) fn kit(&self, id: &KitId) -> Kit {
        KitRepository::fetch(self.backend.store.as_ref(), id)
            .expect("kit lookup")
            .expect("kit exists")
    }

    pub(super) fn kits_with_status(&self, status: KitStatus) -> usize {
        KitRepository::all(self.backend.store.as_ref())
            .expect("list kits")
            .into_iter()
            .filter(|kit| kit.status == status)
            .count()
    }

    pub(super) fn samples_for(&self, id: &AppointmentId) -> Vec<Sample> {
        SampleRepository::for_appointment(self.backend.store.as_ref(), id).expect("samples")
    }

    pub(super) fn sample(&self, id: &SampleId) -> Sample {
        SampleRepository::fetch(self.backend.store.as_ref(), id)
            .expect("sample lookup")
            .expect("sample exists")
    }

    pub(super) fn audit(&self) -> Vec<AuditEntry> {
        self.backend.audit.entries()
    }

    /// Regular appointment owned by [`CUSTOMER`], still `pending`.
    pub(super) fn book(&self) -> Appointment {
        self.service
            .appointments()
            .create(new_appointment(500_000, 150_000), &customer())
            .expect("appointment booked")
            .into_value()
    }

    /// Booked, bound to the technician and confirmed.
    pub(super) fn confirmed(&self) -> Appointment {
        let appointment = self.book();
        self.service
            .assignments()
            .assign_technician(&appointment.id, &StaffId::from("tech-1"), &manager())
            .expect("technician assigned");
        self.service
            .appointments()
            .transition(&appointment.id, AppointmentStatus::Confirmed, &staff())
            .expect("appointment confirmed")
            .into_value()
    }
}

pub(super) struct UnavailableAudit;

impl AuditSink for UnavailableAudit {
    fn append(&self, _entry: AuditEntry) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("audit store offline".to_string()))
    }
}

pub(super) struct UnavailableNotifier;

impl Notifier for UnavailableNotifier {
    fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Transport("smtp refused".to_string()))
    }
}

/// Sample store that rejects the insert with the given (zero-based) index.
pub(super) struct FlakySamples {
    pub(super) inner: Arc<MemoryStore>,
    pub(super) fail_at: usize,
    pub(super) inserts: AtomicUsize,
}

impl SampleRepository for FlakySamples {
    fn insert(&self, sample: Sample) -> Result<Sample, RepositoryError> {
        if self.inserts.fetch_add(1, Ordering::SeqCst) == self.fail_at {
            return Err(RepositoryError::Unavailable("sample store timeout".to_string()));
        }
        SampleRepository::insert(self.inner.as_ref(), sample)
    }

    fn fetch(&self, id: &SampleId) -> Result<Option<Sample>, RepositoryError> {
        SampleRepository::fetch(self.inner.as_ref(), id)
    }

    fn set_collection_date(
        &self,
        id: &SampleId,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        self.inner.set_collection_date(id, date, at)
    }

    fn compare_and_set_status(
        &self,
        id: &SampleId,
        expected: SampleStatus,
        next: SampleStatus,
        received_date: Option<NaiveDate>,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        SampleRepository::compare_and_set_status(
            self.inner.as_ref(),
            id,
            expected,
            next,
            received_date,
            at,
        )
    }

    fn set_photo_url(
        &self,
        id: &SampleId,
        photo_url: String,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        self.inner.set_photo_url(id, photo_url, at)
    }

    fn for_appointment(&self, id: &AppointmentId) -> Result<Vec<Sample>, RepositoryError> {
        SampleRepository::for_appointment(self.inner.as_ref(), id)
    }
}

/// Sample store where staff invalidates the sample, and frees its kit, right before the
/// first collection date is written.
pub(super) struct InvalidatedOnSubmit {
    pub(super) inner: Arc<MemoryStore>,
    pub(super) fired: AtomicBool,
}

impl SampleRepository for InvalidatedOnSubmit {
    fn insert(&self, sample: Sample) -> Result<Sample, RepositoryError> {
        SampleRepository::insert(self.inner.as_ref(), sample)
    }

    fn fetch(&self, id: &SampleId) -> Result<Option<Sample>, RepositoryError> {
        SampleRepository::fetch(self.inner.as_ref(), id)
    }

    fn set_collection_date(
        &self,
        id: &SampleId,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let invalidated = SampleRepository::compare_and_set_status(
                self.inner.as_ref(),
                id,
                SampleStatus::Pending,
                SampleStatus::Invalid,
                None,
                at,
            )?;
            if let Some(sample) = invalidated {
                self.inner.release(&sample.kit_id)?;
            }
        }
        self.inner.set_collection_date(id, date, at)
    }

    fn compare_and_set_status(
        &self,
        id: &SampleId,
        expected: SampleStatus,
        next: SampleStatus,
        received_date: Option<NaiveDate>,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        SampleRepository::compare_and_set_status(
            self.inner.as_ref(),
            id,
            expected,
            next,
            received_date,
            at,
        )
    }

    fn set_photo_url(
        &self,
        id: &SampleId,
        photo_url: String,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        self.inner.set_photo_url(id, photo_url, at)
    }

    fn for_appointment(&self, id: &AppointmentId) -> Result<Vec<Sample>, RepositoryError> {
        SampleRepository::for_appointment(self.inner.as_ref(), id)
    }
}

/// Appointment store where, once `armed`, a sample submission and a deposit land between
/// an assignment's read and its write.
pub(super) struct AdvancedDuringAssignment {
    pub(super) inner: Arc<MemoryStore>,
    pub(super) armed: Arc<AtomicBool>,
    pub(super) deposit: u64,
}

impl AdvancedDuringAssignment {
    fn interleave(&self, id: &AppointmentId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        AppointmentRepository::compare_and_set_status(
            self.inner.as_ref(),
            id,
            AppointmentStatus::Confirmed,
            AppointmentStatus::SampleCollected,
            at,
        )?;
        AppointmentRepository::apply_payment(self.inner.as_ref(), id, self.deposit, at)?;
        Ok(())
    }
}

impl AppointmentRepository for AdvancedDuringAssignment {
    fn insert(&self, appointment: Appointment) -> Result<Appointment, RepositoryError> {
        AppointmentRepository::insert(self.inner.as_ref(), appointment)
    }

    fn fetch(&self, id: &AppointmentId) -> Result<Option<Appointment>, RepositoryError> {
        AppointmentRepository::fetch(self.inner.as_ref(), id)
    }

    fn compare_and_set_status(
        &self,
        id: &AppointmentId,
        expected: AppointmentStatus,
        next: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError> {
        AppointmentRepository::compare_and_set_status(self.inner.as_ref(), id, expected, next, at)
    }

    fn set_staff(
        &self,
        id: &AppointmentId,
        staff: Option<StaffId>,
        slot: Option<SlotId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError> {
        self.interleave(id, at)?;
        self.inner.set_staff(id, staff, slot, at)
    }

    fn set_technician(
        &self,
        id: &AppointmentId,
        technician: Option<StaffId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError> {
        self.interleave(id, at)?;
        self.inner.set_technician(id, technician, at)
    }

    fn count_for_staff_in_slot(
        &self,
        staff: &StaffId,
        slot: &SlotId,
    ) -> Result<usize, RepositoryError> {
        self.inner.count_for_staff_in_slot(staff, slot)
    }

    fn apply_payment(
        &self,
        id: &AppointmentId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Appointment, RepositoryError> {
        AppointmentRepository::apply_payment(self.inner.as_ref(), id, amount, at)
    }
}

/// Kit pool where one kit is always taken by someone else at claim time.
pub(super) struct ContestedKits {
    pub(super) inner: Arc<MemoryStore>,
    pub(super) contested: KitId,
}

impl KitRepository for ContestedKits {
    fn insert(&self, kit: Kit) -> Result<Kit, RepositoryError> {
        KitRepository::insert(self.inner.as_ref(), kit)
    }

    fn fetch(&self, id: &KitId) -> Result<Option<Kit>, RepositoryError> {
        KitRepository::fetch(self.inner.as_ref(), id)
    }

    fn available(&self, limit: usize) -> Result<Vec<Kit>, RepositoryError> {
        self.inner.available(limit)
    }

    fn claim(&self, id: &KitId) -> Result<bool, RepositoryError> {
        if id == &self.contested {
            return Ok(false);
        }
        self.inner.claim(id)
    }

    fn release(&self, id: &KitId) -> Result<bool, RepositoryError> {
        self.inner.release(id)
    }

    fn mark_used(&self, id: &KitId) -> Result<bool, RepositoryError> {
        self.inner.mark_used(id)
    }

    fn all(&self) -> Result<Vec<Kit>, RepositoryError> {
        self.inner.all()
    }
}

/// Kit pool where a concurrent request claims `raced` just before the allocator's first
/// claim of it.
pub(super) struct RacedKits {
    pub(super) inner: Arc<MemoryStore>,
    pub(super) raced: KitId,
    pub(super) fired: AtomicBool,
}

impl KitRepository for RacedKits {
    fn insert(&self, kit: Kit) -> Result<Kit, RepositoryError> {
        KitRepository::insert(self.inner.as_ref(), kit)
    }

    fn fetch(&self, id: &KitId) -> Result<Option<Kit>, RepositoryError> {
        KitRepository::fetch(self.inner.as_ref(), id)
    }

    fn available(&self, limit: usize) -> Result<Vec<Kit>, RepositoryError> {
        self.inner.available(limit)
    }

    fn claim(&self, id: &KitId) -> Result<bool, RepositoryError> {
        if id == &self.raced && !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.claim(id)?;
        }
        self.inner.claim(id)
    }

    fn release(&self, id: &KitId) -> Result<bool, RepositoryError> {
        self.inner.release(id)
    }

    fn mark_used(&self, id: &KitId) -> Result<bool, RepositoryError> {
        self.inner.mark_used(id)
    }

    fn all(&self) -> Result<Vec<Kit>, RepositoryError> {
        self.inner.all()
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
