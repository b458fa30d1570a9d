//! Pre-paid reservations and their one-way conversion into appointments.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{notification, AuditRecord, Outcome, SideEffectReport};
use super::domain::{
    next_id, Appointment, AppointmentId, AppointmentStatus, AppointmentType, AuditSubject,
    PaymentStage, Reservation, ReservationId, ReservationStatus, UserId,
};
use super::error::{BookingError, ValidationErrors};
use super::lifecycle::AppointmentLifecycle;
use super::policy::{Action, Actor, Role};
use super::repository::BookingStores;
use super::saga::Compensations;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationConfig {
    /// How long a pending reservation is held before the sweep expires it.
    pub hold: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            hold: Duration::hours(48),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub customer_id: UserId,
    pub testing_need: String,
    pub preferred_collection_type: AppointmentType,
    pub preferred_date: NaiveDate,
    pub total_amount: u64,
    pub deposit_amount: u64,
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: Vec<ReservationId>,
    /// Reservations that left `pending` between the scan and the write.
    pub skipped: usize,
    /// Audit outcome of each expiry, in `expired` order.
    pub side_effects: Vec<SideEffectReport>,
}

#[derive(Clone)]
pub struct ReservationConverter {
    stores: BookingStores,
    lifecycle: AppointmentLifecycle,
    config: ReservationConfig,
}

impl ReservationConverter {
    pub fn new(
        stores: BookingStores,
        lifecycle: AppointmentLifecycle,
        config: ReservationConfig,
    ) -> Self {
        Self {
            stores,
            lifecycle,
            config,
        }
    }

    pub fn create_reservation(
        &self,
        request: NewReservation,
        actor: &Actor,
    ) -> Result<Outcome<Reservation>, BookingError> {
        self.lifecycle
            .policy()
            .authorize_global(actor, Action::Book)
            .into_result()?;
        if actor.role == Role::Customer && actor.id != request.customer_id {
            return Err(BookingError::Forbidden {
                reason: format!("{actor} cannot reserve on behalf of {}", request.customer_id),
            });
        }

        let now = Utc::now();
        let mut errors = ValidationErrors::new();
        if request.testing_need.trim().is_empty() {
            errors.push("testing_need", "must not be empty");
        }
        if request.total_amount == 0 {
            errors.push("total_amount", "must be greater than zero");
        }
        if request.deposit_amount > request.total_amount {
            errors.push("deposit_amount", "must not exceed total_amount");
        }
        if request.preferred_date < now.date_naive() {
            errors.push("preferred_date", "must not be in the past");
        }
        errors.into_result()?;

        let reservation = Reservation {
            id: ReservationId(next_id("res")),
            customer_id: request.customer_id,
            status: ReservationStatus::Pending,
            testing_need: request.testing_need.trim().to_string(),
            preferred_collection_type: request.preferred_collection_type,
            preferred_date: request.preferred_date,
            total_amount: request.total_amount,
            deposit_amount: request.deposit_amount,
            amount_paid: 0,
            remaining_amount: request.total_amount,
            payment_status: PaymentStage::derive(0, request.deposit_amount, request.total_amount),
            reservation_expires_at: now + self.config.hold,
            converted_appointment_id: None,
            created_at: now,
            updated_at: now,
        };
        let stored = self.stores.reservations.insert(reservation)?;
        info!(
            reservation_id = %stored.id,
            expires_at = %stored.reservation_expires_at,
            "reservation created"
        );

        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Reservation(stored.id.clone()),
                "reservation.created",
                &actor.id,
                now,
            )
            .transition("none", stored.status.label())
            .detail("total_amount", stored.total_amount.to_string()),
        );
        Ok(Outcome::new(stored).with_effect(audit))
    }

    pub fn get_reservation(
        &self,
        id: &ReservationId,
        actor: &Actor,
    ) -> Result<Reservation, BookingError> {
        let reservation = self.load(id)?;
        self.lifecycle
            .policy()
            .authorize_reservation(actor, Action::View, &reservation)
            .into_result()?;
        Ok(reservation)
    }

    pub fn confirm_reservation(
        &self,
        id: &ReservationId,
        actor: &Actor,
    ) -> Result<Outcome<Reservation>, BookingError> {
        let reservation = self.load(id)?;
        self.lifecycle
            .policy()
            .authorize_reservation(actor, Action::ManageReservation, &reservation)
            .into_result()?;
        if reservation.status != ReservationStatus::Pending {
            return Err(BookingError::illegal(
                "reservation",
                reservation.status,
                ReservationStatus::Confirmed,
            ));
        }
        if reservation.reservation_expires_at <= Utc::now() {
            return Err(BookingError::Conflict(format!(
                "reservation {} hold lapsed at {}",
                reservation.id, reservation.reservation_expires_at
            )));
        }
        self.move_status(&reservation, ReservationStatus::Confirmed, actor)
    }

    pub fn cancel_reservation(
        &self,
        id: &ReservationId,
        actor: &Actor,
    ) -> Result<Outcome<Reservation>, BookingError> {
        let reservation = self.load(id)?;
        self.lifecycle
            .policy()
            .authorize_reservation(actor, Action::Cancel, &reservation)
            .into_result()?;
        if !matches!(
            reservation.status,
            ReservationStatus::Pending | ReservationStatus::Confirmed
        ) {
            return Err(BookingError::illegal(
                "reservation",
                reservation.status,
                ReservationStatus::Cancelled,
            ));
        }
        self.move_status(&reservation, ReservationStatus::Cancelled, actor)
    }

    fn move_status(
        &self,
        reservation: &Reservation,
        next: ReservationStatus,
        actor: &Actor,
    ) -> Result<Outcome<Reservation>, BookingError> {
        let now = Utc::now();
        let updated = self
            .stores
            .reservations
            .compare_and_set_status(&reservation.id, reservation.status, next, None, now)?
            .ok_or_else(|| BookingError::illegal("reservation", reservation.status, next))?;
        info!(reservation_id = %updated.id, from = %reservation.status, to = %next, "reservation status changed");

        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Reservation(updated.id.clone()),
                "reservation.status_changed",
                &actor.id,
                now,
            )
            .transition(reservation.status.label(), next.label()),
        );
        Ok(Outcome::new(updated).with_effect(audit))
    }

    /// Turn a confirmed, fully paid reservation into a pending appointment.
    ///
    /// The reservation is claimed first (`confirmed -> converted`), so a repeated or
    /// concurrent conversion fails on the status check. If the appointment insert then
    /// fails, the reservation goes back to `confirmed`.
    pub fn convert(
        &self,
        id: &ReservationId,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        let reservation = self.load(id)?;
        self.lifecycle
            .policy()
            .authorize_reservation(actor, Action::ManageReservation, &reservation)
            .into_result()?;

        if reservation.status != ReservationStatus::Confirmed {
            return Err(BookingError::illegal(
                "reservation",
                reservation.status,
                ReservationStatus::Converted,
            ));
        }
        if reservation.payment_status != PaymentStage::Paid {
            return Err(BookingError::validation(
                "payment_status",
                format!(
                    "reservation must be paid before conversion, found {}",
                    reservation.payment_status.label()
                ),
            ));
        }

        let now = Utc::now();
        let appointment_id = AppointmentId(next_id("apt"));
        let claimed = match self.stores.reservations.compare_and_set_status(
            &reservation.id,
            ReservationStatus::Confirmed,
            ReservationStatus::Converted,
            Some(appointment_id.clone()),
            now,
        )? {
            Some(claimed) => claimed,
            None => {
                let current = self.load(id)?;
                return Err(BookingError::illegal(
                    "reservation",
                    current.status,
                    ReservationStatus::Converted,
                ));
            }
        };

        let mut undo = Compensations::new("reservation-conversion");
        {
            let reservations = self.stores.reservations.clone();
            let id = claimed.id.clone();
            undo.push(format!("restore reservation {id}"), move || {
                reservations
                    .compare_and_set_status(
                        &id,
                        ReservationStatus::Converted,
                        ReservationStatus::Confirmed,
                        None,
                        Utc::now(),
                    )
                    .map(|_| ())
            });
        }

        let appointment = Appointment {
            id: appointment_id,
            customer_id: claimed.customer_id.clone(),
            status: AppointmentStatus::Pending,
            kind: claimed.preferred_collection_type,
            appointment_date: claimed.preferred_date,
            total_amount: claimed.total_amount,
            deposit_amount: claimed.deposit_amount,
            amount_paid: claimed.amount_paid,
            payment_stage: PaymentStage::Paid,
            staff_id: None,
            laboratory_technician_id: None,
            slot_id: None,
            administrative_case_id: None,
            created_at: now,
            updated_at: now,
        };
        let stored = match self.stores.appointments.insert(appointment) {
            Ok(stored) => {
                undo.commit();
                stored
            }
            Err(err) => {
                warn!(reservation_id = %claimed.id, error = %err, "appointment insert failed during conversion");
                undo.unwind();
                return Err(err.into());
            }
        };
        info!(
            reservation_id = %claimed.id,
            appointment_id = %stored.id,
            "reservation converted"
        );

        let trail = self.lifecycle.trail();
        let mut outcome = Outcome::new(stored.clone());
        outcome.extend([
            trail.record(
                AuditRecord::new(
                    AuditSubject::Reservation(claimed.id.clone()),
                    "reservation.converted",
                    &actor.id,
                    now,
                )
                .transition(
                    ReservationStatus::Confirmed.label(),
                    ReservationStatus::Converted.label(),
                )
                .detail("appointment_id", stored.id.to_string()),
            ),
            trail.record(
                AuditRecord::new(
                    AuditSubject::Appointment(stored.id.clone()),
                    "appointment.created",
                    &actor.id,
                    now,
                )
                .transition("none", stored.status.label())
                .detail("reservation_id", claimed.id.to_string()),
            ),
            trail.notify(notification(
                "reservation_converted",
                stored.customer_id.to_string(),
                [
                    ("reservation_id", claimed.id.to_string()),
                    ("appointment_id", stored.id.to_string()),
                ],
            )),
        ]);
        Ok(outcome)
    }

    /// Expire every pending reservation whose hold lapsed at or before `now`. Rows in any
    /// other status are never touched, so repeated sweeps converge.
    pub fn expire_reservations(&self, now: DateTime<Utc>) -> Result<SweepReport, BookingError> {
        let actor = Actor::system();
        let mut report = SweepReport::default();

        for reservation in self.stores.reservations.pending_expired(now)? {
            let expired = self.stores.reservations.compare_and_set_status(
                &reservation.id,
                ReservationStatus::Pending,
                ReservationStatus::Expired,
                None,
                now,
            )?;
            let Some(expired) = expired else {
                report.skipped += 1;
                continue;
            };

            let audit = self.lifecycle.trail().record(
                AuditRecord::new(
                    AuditSubject::Reservation(expired.id.clone()),
                    "reservation.expired",
                    &actor.id,
                    now,
                )
                .transition(
                    ReservationStatus::Pending.label(),
                    ReservationStatus::Expired.label(),
                )
                .detail("expires_at", reservation.reservation_expires_at.to_rfc3339()),
            );
            report.side_effects.push(audit);
            report.expired.push(expired.id);
        }

        if !report.expired.is_empty() || report.skipped > 0 {
            info!(
                expired = report.expired.len(),
                skipped = report.skipped,
                "reservation expiry sweep finished"
            );
        }
        Ok(report)
    }

    fn load(&self, id: &ReservationId) -> Result<Reservation, BookingError> {
        self.stores
            .reservations
            .fetch(id)?
            .ok_or_else(|| BookingError::not_found("reservation", id))
    }
}
