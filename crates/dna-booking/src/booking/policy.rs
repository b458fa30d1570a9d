use std::fmt;

use serde::{Deserialize, Serialize};

use super::domain::{Appointment, Reservation, UserId};
use super::error::BookingError;

/// Role asserted by the authorization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Staff,
    LabTechnician,
    Manager,
    Admin,
    /// Internal callers such as payment callbacks and scheduled sweeps.
    System,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "customer" => Some(Self::Customer),
            "staff" => Some(Self::Staff),
            "lab_technician" | "laboratory_technician" => Some(Self::LabTechnician),
            "manager" => Some(Self::Manager),
            "admin" => Some(Self::Admin),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Staff => "staff",
            Self::LabTechnician => "lab_technician",
            Self::Manager => "manager",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }

    const fn is_back_office(self) -> bool {
        matches!(self, Self::Staff | Self::Manager | Self::Admin | Self::System)
    }

    const fn is_supervisor(self) -> bool {
        matches!(self, Self::Manager | Self::Admin | Self::System)
    }
}

/// Pre-validated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId(id.into()),
            role,
        }
    }

    pub fn system() -> Self {
        Self::new("system", Role::System)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role.label())
    }
}

/// Operation an actor attempts against an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    View,
    Book,
    BookAdministrative,
    Cancel,
    Confirm,
    AdvanceLab,
    AuthorizeCase,
    AllocateSamples,
    SubmitSample,
    ReceiveSample,
    AssignStaff,
    AssignTechnician,
    OpenPayment,
    SettlePayment,
    ManageReservation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(String),
}

impl AccessDecision {
    pub fn into_result(self) -> Result<(), BookingError> {
        match self {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny(reason) => Err(BookingError::Forbidden { reason }),
        }
    }
}

/// Capability rules for each action, independent of the lifecycle logic.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy;

impl AccessPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Rules for actions that do not concern an existing appointment.
    pub fn authorize_global(&self, actor: &Actor, action: Action) -> AccessDecision {
        let allowed = match action {
            Action::Book | Action::OpenPayment => {
                matches!(actor.role, Role::Customer) || actor.role.is_back_office()
            }
            Action::BookAdministrative | Action::AuthorizeCase => actor.role.is_supervisor(),
            Action::SettlePayment | Action::ManageReservation => actor.role.is_back_office(),
            _ => actor.role.is_back_office(),
        };

        if allowed {
            AccessDecision::Allow
        } else {
            AccessDecision::Deny(format!("{} may not perform {:?}", actor, action))
        }
    }

    pub fn authorize(
        &self,
        actor: &Actor,
        action: Action,
        appointment: &Appointment,
    ) -> AccessDecision {
        let owner = actor.role == Role::Customer && actor.id == appointment.customer_id;
        let bound_technician = actor.role == Role::LabTechnician
            && appointment
                .laboratory_technician_id
                .as_ref()
                .map(|id| id.as_str() == actor.id.as_str())
                .unwrap_or(false);

        let allowed = match action {
            Action::View => owner || bound_technician || actor.role.is_back_office(),
            Action::Cancel | Action::AllocateSamples | Action::SubmitSample => {
                owner || actor.role.is_back_office()
            }
            Action::OpenPayment => owner || actor.role.is_back_office(),
            Action::Confirm | Action::ReceiveSample => actor.role.is_back_office(),
            Action::AdvanceLab => bound_technician || actor.role.is_back_office(),
            Action::AssignStaff | Action::AssignTechnician | Action::AuthorizeCase => {
                actor.role.is_supervisor()
            }
            Action::SettlePayment => actor.role.is_back_office(),
            Action::Book | Action::BookAdministrative | Action::ManageReservation => {
                return self.authorize_global(actor, action);
            }
        };

        if allowed {
            AccessDecision::Allow
        } else if actor.role == Role::Customer {
            AccessDecision::Deny(format!(
                "{} does not own appointment {}",
                actor, appointment.id
            ))
        } else {
            AccessDecision::Deny(format!(
                "{} may not perform {:?} on appointment {}",
                actor, action, appointment.id
            ))
        }
    }

    pub fn authorize_reservation(
        &self,
        actor: &Actor,
        action: Action,
        reservation: &Reservation,
    ) -> AccessDecision {
        let owner = actor.role == Role::Customer && actor.id == reservation.customer_id;
        match action {
            Action::View | Action::Cancel | Action::OpenPayment => {
                if owner || actor.role.is_back_office() {
                    AccessDecision::Allow
                } else {
                    AccessDecision::Deny(format!(
                        "{} does not own reservation {}",
                        actor, reservation.id
                    ))
                }
            }
            _ => self.authorize_global(actor, action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::domain::{
        AppointmentId, AppointmentStatus, AppointmentType, PaymentStage, StaffId,
    };
    use chrono::{NaiveDate, Utc};

    fn appointment() -> Appointment {
        let now = Utc::now();
        Appointment {
            id: AppointmentId::from("apt-1"),
            customer_id: UserId::from("cus-1"),
            status: AppointmentStatus::Pending,
            kind: AppointmentType::Facility,
            appointment_date: NaiveDate::from_ymd_opt(2025, 10, 1).expect("valid"),
            total_amount: 500_000,
            deposit_amount: 150_000,
            amount_paid: 0,
            payment_stage: PaymentStage::Unpaid,
            staff_id: None,
            laboratory_technician_id: Some(StaffId::from("tech-1")),
            slot_id: None,
            administrative_case_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn customers_only_touch_their_own_appointments() {
        let policy = AccessPolicy::new();
        let owner = Actor::new("cus-1", Role::Customer);
        let stranger = Actor::new("cus-2", Role::Customer);

        assert_eq!(
            policy.authorize(&owner, Action::SubmitSample, &appointment()),
            AccessDecision::Allow
        );
        match policy.authorize(&stranger, Action::SubmitSample, &appointment()) {
            AccessDecision::Deny(reason) => assert!(reason.contains("does not own")),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn only_supervisors_assign_staff() {
        let policy = AccessPolicy::new();
        assert_eq!(
            policy.authorize(
                &Actor::new("mgr-1", Role::Manager),
                Action::AssignStaff,
                &appointment()
            ),
            AccessDecision::Allow
        );
        assert!(matches!(
            policy.authorize(
                &Actor::new("stf-1", Role::Staff),
                Action::AssignStaff,
                &appointment()
            ),
            AccessDecision::Deny(_)
        ));
    }

    #[test]
    fn bound_technician_may_advance_lab_work() {
        let policy = AccessPolicy::new();
        let bound = Actor::new("tech-1", Role::LabTechnician);
        let other = Actor::new("tech-2", Role::LabTechnician);

        assert_eq!(
            policy.authorize(&bound, Action::AdvanceLab, &appointment()),
            AccessDecision::Allow
        );
        assert!(matches!(
            policy.authorize(&other, Action::AdvanceLab, &appointment()),
            AccessDecision::Deny(_)
        ));
    }

    #[test]
    fn roles_parse_from_header_values() {
        assert_eq!(Role::parse("Lab_Technician"), Some(Role::LabTechnician));
        assert_eq!(Role::parse(" manager "), Some(Role::Manager));
        assert_eq!(Role::parse("guest"), None);
    }
}
