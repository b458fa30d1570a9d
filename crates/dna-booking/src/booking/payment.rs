//! Two-stage payment ledger for appointments and reservations.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{notification, AuditRecord, Outcome};
use super::domain::{
    next_id, AppointmentId, AuditSubject, Payment, PaymentId, PaymentMethod, PaymentStage,
    PaymentStageKind, PaymentStatus, PaymentTarget, Reservation, ReservationId,
};
use super::error::BookingError;
use super::lifecycle::AppointmentLifecycle;
use super::policy::{Action, Actor};
use super::repository::BookingStores;
use super::saga::Compensations;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPayment {
    pub target: PaymentTarget,
    pub stage: PaymentStageKind,
    pub method: PaymentMethod,
}

/// What the holder of an appointment or reservation owes next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentDue {
    pub payment_stage: PaymentStage,
    pub stage: Option<PaymentStageKind>,
    pub amount: u64,
}

impl PaymentDue {
    fn from_amounts(stage: PaymentStage, paid: u64, deposit: u64, total: u64) -> Self {
        let (next, amount) = match stage {
            PaymentStage::Unpaid => (
                Some(PaymentStageKind::Deposit),
                deposit.saturating_sub(paid),
            ),
            PaymentStage::DepositPaid => (
                Some(PaymentStageKind::Remaining),
                total.saturating_sub(paid),
            ),
            PaymentStage::Paid | PaymentStage::GovernmentFunded => (None, 0),
        };
        Self {
            payment_stage: stage,
            stage: next,
            amount,
        }
    }
}

/// Amounts of the payment target at decision time.
struct Ledger {
    owner: String,
    stage: PaymentStage,
    due: PaymentDue,
}

#[derive(Clone)]
pub struct PaymentTracker {
    stores: BookingStores,
    lifecycle: AppointmentLifecycle,
}

impl PaymentTracker {
    pub fn new(stores: BookingStores, lifecycle: AppointmentLifecycle) -> Self {
        Self { stores, lifecycle }
    }

    /// Open a pending payment for the next stage. At most one pending or completed
    /// payment exists per target and stage.
    pub fn open_payment(
        &self,
        request: OpenPayment,
        actor: &Actor,
    ) -> Result<Outcome<Payment>, BookingError> {
        let ledger = self.ledger(&request.target, actor, Action::OpenPayment)?;

        match (ledger.stage, request.stage) {
            (PaymentStage::GovernmentFunded, _) => {
                return Err(BookingError::validation(
                    "target",
                    "government-funded appointments take no payments",
                ));
            }
            (PaymentStage::Paid, _) => {
                return Err(BookingError::Conflict(format!(
                    "{} is already fully paid",
                    request.target
                )));
            }
            (PaymentStage::DepositPaid, PaymentStageKind::Deposit) => {
                return Err(BookingError::Conflict(format!(
                    "the deposit for {} is already settled",
                    request.target
                )));
            }
            (PaymentStage::Unpaid, PaymentStageKind::Remaining) => {
                return Err(BookingError::validation(
                    "stage",
                    "the deposit must be paid before the remaining balance",
                ));
            }
            _ => {}
        }

        let now = Utc::now();
        let payment = Payment {
            id: PaymentId(next_id("pay")),
            target: request.target.clone(),
            amount: ledger.due.amount,
            method: request.method,
            status: PaymentStatus::Pending,
            stage: request.stage,
            order_code: next_id("ord"),
            created_at: now,
            completed_at: None,
        };

        if !self.stores.payments.insert_if_none_active(payment.clone())? {
            return Err(BookingError::Conflict(format!(
                "an active {} payment already exists for {}",
                stage_label(request.stage),
                request.target
            )));
        }
        info!(
            payment_id = %payment.id,
            target = %payment.target,
            amount = payment.amount,
            "payment opened"
        );

        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Payment(payment.id.clone()),
                "payment.opened",
                &actor.id,
                now,
            )
            .transition("none", PaymentStatus::Pending.label())
            .detail("target", payment.target.to_string())
            .detail("stage", stage_label(payment.stage))
            .detail("amount", payment.amount.to_string())
            .detail("owner", ledger.owner),
        );
        Ok(Outcome::new(payment).with_effect(audit))
    }

    /// Settle a pending payment. This is the only path that moves `amount_paid`.
    pub fn complete_payment(
        &self,
        payment_id: &PaymentId,
        actor: &Actor,
    ) -> Result<Outcome<Payment>, BookingError> {
        self.lifecycle
            .policy()
            .authorize_global(actor, Action::SettlePayment)
            .into_result()?;

        let pending = self
            .stores
            .payments
            .fetch(payment_id)?
            .ok_or_else(|| BookingError::not_found("payment", payment_id))?;
        self.ensure_accepts_payments(&pending.target)?;

        let now = Utc::now();
        let completed = self.settle(payment_id, PaymentStatus::Completed)?;

        let mut undo = Compensations::new("payment-completion");
        {
            let payments = self.stores.payments.clone();
            let id = completed.id.clone();
            undo.push(format!("reopen payment {id}"), move || {
                payments
                    .compare_and_set_status(
                        &id,
                        PaymentStatus::Completed,
                        PaymentStatus::Pending,
                        now,
                    )
                    .map(|_| ())
            });
        }

        let applied = match &completed.target {
            PaymentTarget::Appointment(id) => self
                .stores
                .appointments
                .apply_payment(id, completed.amount, now)
                .map(|appointment| {
                    (
                        appointment.customer_id.to_string(),
                        appointment.payment_stage,
                    )
                }),
            PaymentTarget::Reservation(id) => self
                .stores
                .reservations
                .apply_payment(id, completed.amount, now)
                .map(|reservation| {
                    (
                        reservation.customer_id.to_string(),
                        reservation.payment_status,
                    )
                }),
        };
        let (recipient, stage) = match applied {
            Ok(applied) => {
                undo.commit();
                applied
            }
            Err(err) => {
                warn!(payment_id = %completed.id, error = %err, "could not apply payment to its target");
                undo.unwind();
                return Err(err.into());
            }
        };
        info!(
            payment_id = %completed.id,
            target = %completed.target,
            amount = completed.amount,
            payment_stage = stage.label(),
            "payment completed"
        );

        let mut outcome = Outcome::new(completed.clone());
        outcome.extend([
            self.lifecycle.trail().record(
                AuditRecord::new(
                    AuditSubject::Payment(completed.id.clone()),
                    "payment.completed",
                    &actor.id,
                    now,
                )
                .transition(PaymentStatus::Pending.label(), PaymentStatus::Completed.label())
                .detail("target", completed.target.to_string())
                .detail("amount", completed.amount.to_string())
                .detail("payment_stage", stage.label()),
            ),
            self.lifecycle.trail().notify(notification(
                "payment_received",
                recipient,
                [
                    ("payment_id", completed.id.to_string()),
                    ("amount", completed.amount.to_string()),
                    ("payment_stage", stage.label().to_string()),
                ],
            )),
        ]);
        Ok(outcome)
    }

    pub fn fail_payment(
        &self,
        payment_id: &PaymentId,
        actor: &Actor,
    ) -> Result<Outcome<Payment>, BookingError> {
        self.close_without_settlement(payment_id, PaymentStatus::Failed, actor)
    }

    pub fn cancel_payment(
        &self,
        payment_id: &PaymentId,
        actor: &Actor,
    ) -> Result<Outcome<Payment>, BookingError> {
        self.close_without_settlement(payment_id, PaymentStatus::Cancelled, actor)
    }

    fn close_without_settlement(
        &self,
        payment_id: &PaymentId,
        status: PaymentStatus,
        actor: &Actor,
    ) -> Result<Outcome<Payment>, BookingError> {
        self.lifecycle
            .policy()
            .authorize_global(actor, Action::SettlePayment)
            .into_result()?;

        let closed = self.settle(payment_id, status)?;
        info!(payment_id = %closed.id, status = %status, "payment closed without settlement");

        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Payment(closed.id.clone()),
                "payment.closed",
                &actor.id,
                Utc::now(),
            )
            .transition(PaymentStatus::Pending.label(), status.label())
            .detail("target", closed.target.to_string()),
        );
        Ok(Outcome::new(closed).with_effect(audit))
    }

    fn settle(
        &self,
        payment_id: &PaymentId,
        next: PaymentStatus,
    ) -> Result<Payment, BookingError> {
        let payment = self
            .stores
            .payments
            .fetch(payment_id)?
            .ok_or_else(|| BookingError::not_found("payment", payment_id))?;
        if payment.status != PaymentStatus::Pending {
            return Err(BookingError::illegal("payment", payment.status, next));
        }

        match self.stores.payments.compare_and_set_status(
            payment_id,
            PaymentStatus::Pending,
            next,
            Utc::now(),
        )? {
            Some(updated) => Ok(updated),
            None => {
                let current = self
                    .stores
                    .payments
                    .fetch(payment_id)?
                    .map(|payment| payment.status)
                    .unwrap_or(payment.status);
                Err(BookingError::illegal("payment", current, next))
            }
        }
    }

    pub fn next_due(
        &self,
        appointment_id: &AppointmentId,
        actor: &Actor,
    ) -> Result<PaymentDue, BookingError> {
        let target = PaymentTarget::Appointment(appointment_id.clone());
        Ok(self.ledger(&target, actor, Action::View)?.due)
    }

    pub fn reservation_due(
        &self,
        reservation_id: &ReservationId,
        actor: &Actor,
    ) -> Result<PaymentDue, BookingError> {
        let target = PaymentTarget::Reservation(reservation_id.clone());
        Ok(self.ledger(&target, actor, Action::View)?.due)
    }

    pub fn payments_for(
        &self,
        target: &PaymentTarget,
        actor: &Actor,
    ) -> Result<Vec<Payment>, BookingError> {
        self.ledger(target, actor, Action::View)?;
        Ok(self.stores.payments.for_target(target)?)
    }

    fn ledger(
        &self,
        target: &PaymentTarget,
        actor: &Actor,
        action: Action,
    ) -> Result<Ledger, BookingError> {
        match target {
            PaymentTarget::Appointment(id) => {
                let appointment = self.lifecycle.load(id)?;
                self.lifecycle
                    .policy()
                    .authorize(actor, action, &appointment)
                    .into_result()?;
                if action == Action::OpenPayment && appointment.status.is_terminal() {
                    return Err(closed_target(target, appointment.status));
                }
                Ok(Ledger {
                    owner: appointment.customer_id.to_string(),
                    stage: appointment.payment_stage,
                    due: PaymentDue::from_amounts(
                        appointment.payment_stage,
                        appointment.amount_paid,
                        appointment.deposit_amount,
                        appointment.total_amount,
                    ),
                })
            }
            PaymentTarget::Reservation(id) => {
                let reservation = self.load_reservation(id)?;
                self.lifecycle
                    .policy()
                    .authorize_reservation(actor, action, &reservation)
                    .into_result()?;
                if action == Action::OpenPayment && !reservation.status.accepts_payments() {
                    return Err(closed_target(target, reservation.status));
                }
                Ok(Ledger {
                    owner: reservation.customer_id.to_string(),
                    stage: reservation.payment_status,
                    due: PaymentDue::from_amounts(
                        reservation.payment_status,
                        reservation.amount_paid,
                        reservation.deposit_amount,
                        reservation.total_amount,
                    ),
                })
            }
        }
    }

    /// Settlement follows the same rule as opening: cancelled, completed, expired and
    /// converted targets take no money.
    fn ensure_accepts_payments(&self, target: &PaymentTarget) -> Result<(), BookingError> {
        match target {
            PaymentTarget::Appointment(id) => {
                let appointment = self.lifecycle.load(id)?;
                if appointment.status.is_terminal() {
                    return Err(closed_target(target, appointment.status));
                }
            }
            PaymentTarget::Reservation(id) => {
                let reservation = self.load_reservation(id)?;
                if !reservation.status.accepts_payments() {
                    return Err(closed_target(target, reservation.status));
                }
            }
        }
        Ok(())
    }

    fn load_reservation(&self, id: &ReservationId) -> Result<Reservation, BookingError> {
        self.stores
            .reservations
            .fetch(id)?
            .ok_or_else(|| BookingError::not_found("reservation", id))
    }
}

fn closed_target(target: &PaymentTarget, status: impl fmt::Display) -> BookingError {
    BookingError::Conflict(format!("{target} is {status} and takes no payments"))
}

fn stage_label(stage: PaymentStageKind) -> &'static str {
    match stage {
        PaymentStageKind::Deposit => "deposit",
        PaymentStageKind::Remaining => "remaining",
    }
}
