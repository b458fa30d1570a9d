//! Appointment state machine.
//!
//! Every status change funnels through [`AppointmentLifecycle::commit_transition`], which
//! performs a compare-and-set on the stored status and then writes audit history and
//! notifications as best-effort side effects.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::audit::{
    notification, AuditRecord, AuditTrail, Outcome, SideEffectKind, SideEffectReport,
};
use super::domain::{
    next_id, Appointment, AppointmentId, AppointmentStatus, AppointmentType, AuditSubject,
    CaseId, PaymentStage, SampleStatus, SlotId, UserId,
};
use super::error::{BookingError, ValidationErrors};
use super::policy::{AccessPolicy, Action, Actor, Role};
use super::repository::BookingStores;

/// Customer booking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub customer_id: UserId,
    #[serde(rename = "type")]
    pub kind: AppointmentType,
    pub appointment_date: NaiveDate,
    pub total_amount: u64,
    pub deposit_amount: u64,
    #[serde(default)]
    pub slot_id: Option<SlotId>,
}

/// Government-funded booking created from an administrative case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAdministrativeAppointment {
    pub customer_id: UserId,
    pub case_id: CaseId,
    #[serde(rename = "type")]
    pub kind: AppointmentType,
    pub appointment_date: NaiveDate,
    #[serde(default)]
    pub pre_authorized: bool,
    #[serde(default)]
    pub slot_id: Option<SlotId>,
    #[serde(default)]
    pub agency_contact: Option<String>,
}

#[derive(Clone)]
pub struct AppointmentLifecycle {
    stores: BookingStores,
    trail: AuditTrail,
    policy: AccessPolicy,
}

impl AppointmentLifecycle {
    pub fn new(stores: BookingStores) -> Self {
        let trail = AuditTrail::new(
            stores.audit.clone(),
            stores.notifier.clone(),
            stores.cases.clone(),
        );
        Self {
            stores,
            trail,
            policy: AccessPolicy::new(),
        }
    }

    pub(crate) fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    pub(crate) fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub(crate) fn load(&self, id: &AppointmentId) -> Result<Appointment, BookingError> {
        self.stores
            .appointments
            .fetch(id)?
            .ok_or_else(|| BookingError::not_found("appointment", id))
    }

    pub fn get(&self, id: &AppointmentId, actor: &Actor) -> Result<Appointment, BookingError> {
        let appointment = self.load(id)?;
        self.policy
            .authorize(actor, Action::View, &appointment)
            .into_result()?;
        Ok(appointment)
    }

    /// Book a regular, customer-paid appointment in `pending` / `unpaid`.
    pub fn create(
        &self,
        request: NewAppointment,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        self.policy
            .authorize_global(actor, Action::Book)
            .into_result()?;
        if actor.role == Role::Customer && actor.id != request.customer_id {
            return Err(BookingError::Forbidden {
                reason: format!("{actor} cannot book on behalf of {}", request.customer_id),
            });
        }

        let now = Utc::now();
        let mut errors = ValidationErrors::new();
        if request.customer_id.as_str().trim().is_empty() {
            errors.push("customer_id", "must not be empty");
        }
        if request.total_amount == 0 {
            errors.push("total_amount", "must be greater than zero");
        }
        if request.deposit_amount > request.total_amount {
            errors.push("deposit_amount", "must not exceed total_amount");
        }
        if request.appointment_date < now.date_naive() {
            errors.push("appointment_date", "must not be in the past");
        }
        errors.into_result()?;

        let appointment = Appointment {
            id: AppointmentId(next_id("apt")),
            customer_id: request.customer_id,
            status: AppointmentStatus::Pending,
            kind: request.kind,
            appointment_date: request.appointment_date,
            total_amount: request.total_amount,
            deposit_amount: request.deposit_amount,
            amount_paid: 0,
            payment_stage: PaymentStage::derive(0, request.deposit_amount, request.total_amount),
            staff_id: None,
            laboratory_technician_id: None,
            slot_id: request.slot_id,
            administrative_case_id: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self.stores.appointments.insert(appointment)?;
        info!(appointment_id = %stored.id, customer_id = %stored.customer_id, "appointment booked");

        let audit = self.trail.record(
            AuditRecord::new(
                AuditSubject::Appointment(stored.id.clone()),
                "appointment.created",
                &actor.id,
                now,
            )
            .transition("none", stored.status.label())
            .detail("total_amount", stored.total_amount.to_string())
            .detail("deposit_amount", stored.deposit_amount.to_string()),
        );
        Ok(Outcome::new(stored).with_effect(audit))
    }

    /// Book a government-funded appointment for an administrative case; payment staging
    /// is bypassed entirely.
    pub fn create_administrative(
        &self,
        request: NewAdministrativeAppointment,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        self.policy
            .authorize_global(actor, Action::BookAdministrative)
            .into_result()?;

        let now = Utc::now();
        let mut errors = ValidationErrors::new();
        if request.customer_id.as_str().trim().is_empty() {
            errors.push("customer_id", "must not be empty");
        }
        if request.case_id.as_str().trim().is_empty() {
            errors.push("case_id", "must not be empty");
        }
        if request.appointment_date < now.date_naive() {
            errors.push("appointment_date", "must not be in the past");
        }
        errors.into_result()?;

        let status = if request.pre_authorized {
            AppointmentStatus::Authorized
        } else {
            AppointmentStatus::AwaitingAuthorization
        };

        let appointment = Appointment {
            id: AppointmentId(next_id("apt")),
            customer_id: request.customer_id,
            status,
            kind: request.kind,
            appointment_date: request.appointment_date,
            total_amount: 0,
            deposit_amount: 0,
            amount_paid: 0,
            payment_stage: PaymentStage::GovernmentFunded,
            staff_id: None,
            laboratory_technician_id: None,
            slot_id: request.slot_id,
            administrative_case_id: Some(request.case_id.clone()),
            created_at: now,
            updated_at: now,
        };

        let stored = self.stores.appointments.insert(appointment)?;
        info!(
            appointment_id = %stored.id,
            case_id = %request.case_id,
            status = %stored.status,
            "administrative appointment booked"
        );

        let mut outcome = Outcome::new(stored.clone());
        outcome.extend([
            self.trail.record(
                AuditRecord::new(
                    AuditSubject::Appointment(stored.id.clone()),
                    "appointment.administrative_created",
                    &actor.id,
                    now,
                )
                .transition("none", stored.status.label())
                .detail("case_id", request.case_id.to_string()),
            ),
            self.trail.link_case(&request.case_id, &stored.id),
            self.trail.notify(notification(
                "administrative_appointment_scheduled",
                request
                    .agency_contact
                    .unwrap_or_else(|| stored.customer_id.to_string()),
                [
                    ("appointment_id", stored.id.to_string()),
                    ("case_id", request.case_id.to_string()),
                    ("appointment_date", stored.appointment_date.to_string()),
                ],
            )),
        ]);
        Ok(outcome)
    }

    /// Move an appointment to `target` on behalf of `actor`.
    pub fn transition(
        &self,
        id: &AppointmentId,
        target: AppointmentStatus,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        if target == AppointmentStatus::Cancelled {
            return self.cancel(id, actor);
        }

        let appointment = self.load(id)?;
        self.policy
            .authorize(actor, action_for(target), &appointment)
            .into_result()?;

        if !appointment.status.can_transition_to(target) {
            warn!(
                appointment_id = %appointment.id,
                from = %appointment.status,
                to = %target,
                "illegal appointment transition requested"
            );
            return Err(BookingError::illegal(
                "appointment",
                appointment.status,
                target,
            ));
        }

        self.check_preconditions(&appointment, target)?;
        self.commit_transition(&appointment, target, actor, "appointment.status_changed")
    }

    /// Cancel a live appointment. Kits held by samples that were never submitted go back
    /// to the pool.
    pub fn cancel(
        &self,
        id: &AppointmentId,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        let appointment = self.load(id)?;
        self.policy
            .authorize(actor, Action::Cancel, &appointment)
            .into_result()?;

        if !appointment
            .status
            .can_transition_to(AppointmentStatus::Cancelled)
        {
            return Err(BookingError::illegal(
                "appointment",
                appointment.status,
                AppointmentStatus::Cancelled,
            ));
        }

        let mut outcome = self.commit_transition(
            &appointment,
            AppointmentStatus::Cancelled,
            actor,
            "appointment.cancelled",
        )?;
        let releases = self.release_unsubmitted_kits(&outcome.value);
        outcome.extend(releases);
        Ok(outcome)
    }

    fn check_preconditions(
        &self,
        appointment: &Appointment,
        target: AppointmentStatus,
    ) -> Result<(), BookingError> {
        match target {
            AppointmentStatus::Confirmed if !appointment.has_assignment() => {
                Err(BookingError::validation(
                    "staff_id",
                    "a staff member or laboratory technician must be assigned before confirming",
                ))
            }
            AppointmentStatus::SampleCollected => {
                let samples = self.stores.samples.for_appointment(&appointment.id)?;
                if samples.iter().any(|sample| sample.collection_date.is_some()) {
                    Ok(())
                } else {
                    Err(BookingError::validation(
                        "samples",
                        "no sample has been submitted with a collection date",
                    ))
                }
            }
            AppointmentStatus::SampleReceived => {
                let samples = self.stores.samples.for_appointment(&appointment.id)?;
                let received = samples.iter().any(|sample| {
                    matches!(
                        sample.status,
                        SampleStatus::Received | SampleStatus::Testing | SampleStatus::Completed
                    )
                });
                if received {
                    Ok(())
                } else {
                    Err(BookingError::validation(
                        "samples",
                        "no sample has been received by the laboratory",
                    ))
                }
            }
            AppointmentStatus::Authorized
                if appointment.administrative_case_id.is_none() =>
            {
                Err(BookingError::validation(
                    "administrative_case_id",
                    "only administrative appointments can be authorized",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Persist `appointment.status -> target` and emit its side effects. Callers have
    /// already validated the edge; a concurrent writer turns into an illegal transition.
    pub(crate) fn commit_transition(
        &self,
        appointment: &Appointment,
        target: AppointmentStatus,
        actor: &Actor,
        action: &str,
    ) -> Result<Outcome<Appointment>, BookingError> {
        let now = Utc::now();
        let updated = match self.stores.appointments.compare_and_set_status(
            &appointment.id,
            appointment.status,
            target,
            now,
        )? {
            Some(updated) => updated,
            None => {
                let current = self.load(&appointment.id)?;
                warn!(
                    appointment_id = %appointment.id,
                    expected = %appointment.status,
                    found = %current.status,
                    "appointment status changed concurrently"
                );
                return Err(BookingError::illegal("appointment", current.status, target));
            }
        };

        info!(
            appointment_id = %updated.id,
            from = %appointment.status,
            to = %target,
            actor = %actor.id,
            "appointment status changed"
        );

        let mut outcome = Outcome::new(updated.clone());
        outcome.side_effects.push(
            self.trail.record(
                AuditRecord::new(
                    AuditSubject::Appointment(updated.id.clone()),
                    action,
                    &actor.id,
                    now,
                )
                .transition(appointment.status.label(), target.label()),
            ),
        );

        if let Some(template) = notification_template(target) {
            outcome.side_effects.push(self.trail.notify(notification(
                template,
                updated.customer_id.to_string(),
                [
                    ("appointment_id", updated.id.to_string()),
                    ("status", target.label().to_string()),
                ],
            )));
        }

        Ok(outcome)
    }

    /// Advance the appointment after a sample event, if it is waiting for one. Used by the
    /// sample allocator; the acting user was authorized for the sample operation itself.
    pub(crate) fn advance_from_sample_event(
        &self,
        id: &AppointmentId,
        target: AppointmentStatus,
        actor: &Actor,
    ) -> Result<Option<Outcome<Appointment>>, BookingError> {
        let appointment = self.load(id)?;
        let eligible = match target {
            AppointmentStatus::SampleCollected => appointment.status.awaits_collection(),
            AppointmentStatus::SampleReceived => {
                appointment.status == AppointmentStatus::SampleCollected
            }
            _ => false,
        };

        if !eligible {
            debug!(
                appointment_id = %appointment.id,
                status = %appointment.status,
                target = %target,
                "sample event does not move appointment"
            );
            return Ok(None);
        }

        match self.commit_transition(&appointment, target, actor, "appointment.sample_event") {
            Ok(outcome) => Ok(Some(outcome)),
            // Another sample event already advanced it.
            Err(BookingError::IllegalTransition { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn release_unsubmitted_kits(&self, appointment: &Appointment) -> Vec<SideEffectReport> {
        let samples = match self.stores.samples.for_appointment(&appointment.id) {
            Ok(samples) => samples,
            Err(err) => {
                warn!(appointment_id = %appointment.id, error = %err, "could not list samples for kit release");
                return vec![SideEffectReport::failed(
                    SideEffectKind::KitRelease,
                    err.to_string(),
                )];
            }
        };

        samples
            .into_iter()
            .filter(|sample| {
                sample.status == SampleStatus::Pending && sample.collection_date.is_none()
            })
            .filter_map(|sample| {
                let kit_id = sample.kit_id.clone();
                let result = self
                    .stores
                    .samples
                    .compare_and_set_status(
                        &sample.id,
                        SampleStatus::Pending,
                        SampleStatus::Invalid,
                        None,
                        Utc::now(),
                    )
                    .and_then(|invalidated| match invalidated {
                        // A submission that landed first keeps its kit on the way to `used`.
                        Some(sample) if sample.collection_date.is_none() => {
                            self.stores.kits.release(&kit_id).map(Some)
                        }
                        _ => Ok(None),
                    });
                match result {
                    Ok(Some(_)) => Some(SideEffectReport::ok(SideEffectKind::KitRelease)),
                    Ok(None) => None,
                    Err(err) => {
                        warn!(kit_id = %kit_id, error = %err, "kit release after cancellation failed");
                        Some(SideEffectReport::failed(SideEffectKind::KitRelease, err.to_string()))
                    }
                }
            })
            .collect()
    }
}

fn action_for(target: AppointmentStatus) -> Action {
    match target {
        AppointmentStatus::Confirmed => Action::Confirm,
        AppointmentStatus::SampleCollected => Action::SubmitSample,
        AppointmentStatus::SampleReceived => Action::ReceiveSample,
        AppointmentStatus::Testing | AppointmentStatus::Completed => Action::AdvanceLab,
        AppointmentStatus::Authorized | AppointmentStatus::ReadyForCollection => {
            Action::AuthorizeCase
        }
        AppointmentStatus::Cancelled => Action::Cancel,
        AppointmentStatus::Pending | AppointmentStatus::AwaitingAuthorization => Action::Book,
    }
}

fn notification_template(status: AppointmentStatus) -> Option<&'static str> {
    match status {
        AppointmentStatus::Confirmed => Some("appointment_confirmed"),
        AppointmentStatus::Authorized => Some("appointment_authorized"),
        AppointmentStatus::SampleReceived => Some("sample_received"),
        AppointmentStatus::Completed => Some("results_ready"),
        AppointmentStatus::Cancelled => Some("appointment_cancelled"),
        _ => None,
    }
}
