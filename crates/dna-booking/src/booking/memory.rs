//! Mutex-backed implementations of every storage and collaborator trait.
//!
//! Each method holds the collection lock for its whole read-modify-write, which is what
//! gives `claim`, the `compare_and_set_*` family and `insert_if_none_active` their
//! single-document atomicity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};

use super::domain::{
    Appointment, AppointmentId, AppointmentStatus, AuditEntry, CaseId, Kit, KitId, KitStatus,
    Payment, PaymentId, PaymentStage, PaymentStatus, PaymentTarget, Reservation, ReservationId,
    ReservationStatus, Sample, SampleId, SampleStatus, SlotId, StaffId, StaffMember,
};
use super::repository::{
    AppointmentRepository, AuditError, AuditSink, BookingStores, CaseRegistry, KitRepository,
    Notification, Notifier, NotifyError, PaymentRepository, RepositoryError,
    ReservationRepository, SampleRepository, StaffDirectory,
};

#[derive(Default, Clone)]
pub struct MemoryStore {
    appointments: Arc<Mutex<HashMap<AppointmentId, Appointment>>>,
    samples: Arc<Mutex<BTreeMap<SampleId, Sample>>>,
    kits: Arc<Mutex<BTreeMap<KitId, Kit>>>,
    reservations: Arc<Mutex<HashMap<ReservationId, Reservation>>>,
    payments: Arc<Mutex<BTreeMap<PaymentId, Payment>>>,
}

impl AppointmentRepository for MemoryStore {
    fn insert(&self, appointment: Appointment) -> Result<Appointment, RepositoryError> {
        let mut guard = self.appointments.lock().expect("appointment mutex poisoned");
        if guard.contains_key(&appointment.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(appointment.id.clone(), appointment.clone());
        Ok(appointment)
    }

    fn fetch(&self, id: &AppointmentId) -> Result<Option<Appointment>, RepositoryError> {
        let guard = self.appointments.lock().expect("appointment mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn compare_and_set_status(
        &self,
        id: &AppointmentId,
        expected: AppointmentStatus,
        next: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError> {
        let mut guard = self.appointments.lock().expect("appointment mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if stored.status != expected {
            return Ok(None);
        }
        stored.status = next;
        stored.updated_at = at;
        Ok(Some(stored.clone()))
    }

    fn set_staff(
        &self,
        id: &AppointmentId,
        staff: Option<StaffId>,
        slot: Option<SlotId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError> {
        let mut guard = self.appointments.lock().expect("appointment mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Ok(None);
        }
        stored.staff_id = staff;
        if slot.is_some() {
            stored.slot_id = slot;
        }
        stored.updated_at = at;
        Ok(Some(stored.clone()))
    }

    fn set_technician(
        &self,
        id: &AppointmentId,
        technician: Option<StaffId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Appointment>, RepositoryError> {
        let mut guard = self.appointments.lock().expect("appointment mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Ok(None);
        }
        stored.laboratory_technician_id = technician;
        stored.updated_at = at;
        Ok(Some(stored.clone()))
    }

    fn count_for_staff_in_slot(
        &self,
        staff: &StaffId,
        slot: &SlotId,
    ) -> Result<usize, RepositoryError> {
        let guard = self.appointments.lock().expect("appointment mutex poisoned");
        Ok(guard
            .values()
            .filter(|appointment| appointment.status != AppointmentStatus::Cancelled)
            .filter(|appointment| appointment.staff_id.as_ref() == Some(staff))
            .filter(|appointment| appointment.slot_id.as_ref() == Some(slot))
            .count())
    }

    fn apply_payment(
        &self,
        id: &AppointmentId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Appointment, RepositoryError> {
        let mut guard = self.appointments.lock().expect("appointment mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let amount_paid = stored.amount_paid.saturating_add(amount);
        if stored.status.is_terminal() || amount_paid > stored.total_amount {
            return Err(RepositoryError::Conflict);
        }
        stored.amount_paid = amount_paid;
        stored.payment_stage =
            PaymentStage::derive(amount_paid, stored.deposit_amount, stored.total_amount);
        stored.updated_at = at;
        Ok(stored.clone())
    }
}

impl SampleRepository for MemoryStore {
    fn insert(&self, sample: Sample) -> Result<Sample, RepositoryError> {
        let mut guard = self.samples.lock().expect("sample mutex poisoned");
        let kit_taken = guard.values().any(|existing| {
            existing.kit_id == sample.kit_id
                && existing.status != SampleStatus::Invalid
        });
        if kit_taken || guard.contains_key(&sample.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(sample.id.clone(), sample.clone());
        Ok(sample)
    }

    fn fetch(&self, id: &SampleId) -> Result<Option<Sample>, RepositoryError> {
        let guard = self.samples.lock().expect("sample mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn set_collection_date(
        &self,
        id: &SampleId,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        let mut guard = self.samples.lock().expect("sample mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if stored.status != SampleStatus::Pending || stored.collection_date.is_some() {
            return Ok(None);
        }
        stored.collection_date = Some(date);
        stored.updated_at = at;
        Ok(Some(stored.clone()))
    }

    fn compare_and_set_status(
        &self,
        id: &SampleId,
        expected: SampleStatus,
        next: SampleStatus,
        received_date: Option<NaiveDate>,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        let mut guard = self.samples.lock().expect("sample mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if stored.status != expected {
            return Ok(None);
        }
        stored.status = next;
        if received_date.is_some() {
            stored.received_date = received_date;
        }
        stored.updated_at = at;
        Ok(Some(stored.clone()))
    }

    fn set_photo_url(
        &self,
        id: &SampleId,
        photo_url: String,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, RepositoryError> {
        let mut guard = self.samples.lock().expect("sample mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let Some(person) = stored.person_info.as_mut() else {
            return Ok(None);
        };
        person.photo_url = Some(photo_url);
        stored.updated_at = at;
        Ok(Some(stored.clone()))
    }

    fn for_appointment(&self, id: &AppointmentId) -> Result<Vec<Sample>, RepositoryError> {
        let guard = self.samples.lock().expect("sample mutex poisoned");
        let mut samples: Vec<Sample> = guard
            .values()
            .filter(|sample| &sample.appointment_id == id)
            .cloned()
            .collect();
        samples.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(samples)
    }
}

impl MemoryStore {
    fn transition_kit(
        &self,
        id: &KitId,
        expected: KitStatus,
        next: KitStatus,
    ) -> Result<bool, RepositoryError> {
        let mut guard = self.kits.lock().expect("kit mutex poisoned");
        let kit = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if kit.status != expected {
            return Ok(false);
        }
        kit.status = next;
        Ok(true)
    }
}

impl KitRepository for MemoryStore {
    fn insert(&self, kit: Kit) -> Result<Kit, RepositoryError> {
        let mut guard = self.kits.lock().expect("kit mutex poisoned");
        if guard.contains_key(&kit.id) || guard.values().any(|existing| existing.code == kit.code)
        {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(kit.id.clone(), kit.clone());
        Ok(kit)
    }

    fn fetch(&self, id: &KitId) -> Result<Option<Kit>, RepositoryError> {
        let guard = self.kits.lock().expect("kit mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn available(&self, limit: usize) -> Result<Vec<Kit>, RepositoryError> {
        let guard = self.kits.lock().expect("kit mutex poisoned");
        let mut kits: Vec<Kit> = guard
            .values()
            .filter(|kit| kit.status == KitStatus::Available)
            .cloned()
            .collect();
        kits.sort_by(|a, b| a.code.cmp(&b.code));
        kits.truncate(limit);
        Ok(kits)
    }

    fn claim(&self, id: &KitId) -> Result<bool, RepositoryError> {
        self.transition_kit(id, KitStatus::Available, KitStatus::Assigned)
    }

    fn release(&self, id: &KitId) -> Result<bool, RepositoryError> {
        self.transition_kit(id, KitStatus::Assigned, KitStatus::Available)
    }

    fn mark_used(&self, id: &KitId) -> Result<bool, RepositoryError> {
        self.transition_kit(id, KitStatus::Assigned, KitStatus::Used)
    }

    fn all(&self) -> Result<Vec<Kit>, RepositoryError> {
        let guard = self.kits.lock().expect("kit mutex poisoned");
        Ok(guard.values().cloned().collect())
    }
}

impl ReservationRepository for MemoryStore {
    fn insert(&self, reservation: Reservation) -> Result<Reservation, RepositoryError> {
        let mut guard = self.reservations.lock().expect("reservation mutex poisoned");
        if guard.contains_key(&reservation.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    fn fetch(&self, id: &ReservationId) -> Result<Option<Reservation>, RepositoryError> {
        let guard = self.reservations.lock().expect("reservation mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn compare_and_set_status(
        &self,
        id: &ReservationId,
        expected: ReservationStatus,
        next: ReservationStatus,
        converted_to: Option<AppointmentId>,
        at: DateTime<Utc>,
    ) -> Result<Option<Reservation>, RepositoryError> {
        let mut guard = self.reservations.lock().expect("reservation mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if stored.status != expected {
            return Ok(None);
        }
        stored.status = next;
        stored.converted_appointment_id = converted_to;
        stored.updated_at = at;
        Ok(Some(stored.clone()))
    }

    fn pending_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, RepositoryError> {
        let guard = self.reservations.lock().expect("reservation mutex poisoned");
        let mut expired: Vec<Reservation> = guard
            .values()
            .filter(|reservation| reservation.status == ReservationStatus::Pending)
            .filter(|reservation| reservation.reservation_expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(expired)
    }

    fn apply_payment(
        &self,
        id: &ReservationId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Reservation, RepositoryError> {
        let mut guard = self.reservations.lock().expect("reservation mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !stored.status.accepts_payments()
            || stored.amount_paid.saturating_add(amount) > stored.total_amount
        {
            return Err(RepositoryError::Conflict);
        }
        stored.apply_payment(amount, at);
        Ok(stored.clone())
    }
}

impl PaymentRepository for MemoryStore {
    fn insert_if_none_active(&self, payment: Payment) -> Result<bool, RepositoryError> {
        let mut guard = self.payments.lock().expect("payment mutex poisoned");
        let active_exists = guard.values().any(|existing| {
            existing.target == payment.target
                && existing.stage == payment.stage
                && existing.status.is_active()
        });
        if active_exists {
            return Ok(false);
        }
        if guard.contains_key(&payment.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(payment.id.clone(), payment);
        Ok(true)
    }

    fn fetch(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        let guard = self.payments.lock().expect("payment mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn compare_and_set_status(
        &self,
        id: &PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>, RepositoryError> {
        let mut guard = self.payments.lock().expect("payment mutex poisoned");
        let stored = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if stored.status != expected {
            return Ok(None);
        }
        stored.status = next;
        if next == PaymentStatus::Completed {
            stored.completed_at = Some(at);
        }
        Ok(Some(stored.clone()))
    }

    fn for_target(&self, target: &PaymentTarget) -> Result<Vec<Payment>, RepositoryError> {
        let guard = self.payments.lock().expect("payment mutex poisoned");
        Ok(guard
            .values()
            .filter(|payment| &payment.target == target)
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct MemoryAuditLog {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditLog {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit mutex poisoned").clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries
            .lock()
            .expect("audit mutex poisoned")
            .push(entry);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().expect("notifier mutex poisoned").clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.events
            .lock()
            .expect("notifier mutex poisoned")
            .push(notification);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryCaseRegistry {
    links: Arc<Mutex<BTreeMap<CaseId, Vec<AppointmentId>>>>,
}

impl MemoryCaseRegistry {
    pub fn appointments_for(&self, case: &CaseId) -> Vec<AppointmentId> {
        self.links
            .lock()
            .expect("case mutex poisoned")
            .get(case)
            .cloned()
            .unwrap_or_default()
    }
}

impl CaseRegistry for MemoryCaseRegistry {
    fn link_appointment(
        &self,
        case: &CaseId,
        appointment: &AppointmentId,
    ) -> Result<(), RepositoryError> {
        let mut guard = self.links.lock().expect("case mutex poisoned");
        let linked = guard.entry(case.clone()).or_default();
        if !linked.contains(appointment) {
            linked.push(appointment.clone());
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryStaffDirectory {
    members: Arc<Mutex<Vec<StaffMember>>>,
}

impl MemoryStaffDirectory {
    pub fn with_members(members: Vec<StaffMember>) -> Self {
        Self {
            members: Arc::new(Mutex::new(members)),
        }
    }

    pub fn add(&self, member: StaffMember) {
        let mut guard = self.members.lock().expect("staff mutex poisoned");
        guard.retain(|existing| existing.id != member.id);
        guard.push(member);
    }
}

impl StaffDirectory for MemoryStaffDirectory {
    fn member(&self, id: &StaffId) -> Result<Option<StaffMember>, RepositoryError> {
        let guard = self.members.lock().expect("staff mutex poisoned");
        Ok(guard.iter().find(|member| &member.id == id).cloned())
    }

    fn roster(&self, slot: &SlotId) -> Result<Vec<StaffMember>, RepositoryError> {
        let guard = self.members.lock().expect("staff mutex poisoned");
        Ok(guard
            .iter()
            .filter(|member| member.active && member.slots.contains(slot))
            .cloned()
            .collect())
    }
}

/// In-memory backend with typed handles kept for inspection.
#[derive(Default, Clone)]
pub struct MemoryBackend {
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditLog>,
    pub notifier: Arc<MemoryNotifier>,
    pub cases: Arc<MemoryCaseRegistry>,
    pub staff: Arc<MemoryStaffDirectory>,
}

impl MemoryBackend {
    pub fn stores(&self) -> BookingStores {
        BookingStores {
            appointments: self.store.clone(),
            samples: self.store.clone(),
            kits: self.store.clone(),
            reservations: self.store.clone(),
            payments: self.store.clone(),
            audit: self.audit.clone(),
            notifier: self.notifier.clone(),
            cases: self.cases.clone(),
            staff: self.staff.clone(),
        }
    }
}
