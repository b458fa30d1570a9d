use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::audit::{AuditRecord, Outcome};
use super::domain::{
    Appointment, AppointmentId, AuditSubject, SlotId, StaffId, StaffMember, StaffRole,
};
use super::error::{BookingError, StaffSuggestion};
use super::lifecycle::AppointmentLifecycle;
use super::policy::{Action, Actor};
use super::repository::BookingStores;

/// Per-slot appointment ceiling for staff members. A staff override beats a slot
/// override, which beats the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffCapacityPolicy {
    pub default_limit: u32,
    pub slot_limits: HashMap<SlotId, u32>,
    pub staff_limits: HashMap<StaffId, u32>,
}

impl StaffCapacityPolicy {
    pub fn new(default_limit: u32) -> Self {
        Self {
            default_limit,
            slot_limits: HashMap::new(),
            staff_limits: HashMap::new(),
        }
    }

    pub fn with_slot_limit(mut self, slot: SlotId, limit: u32) -> Self {
        self.slot_limits.insert(slot, limit);
        self
    }

    pub fn with_staff_limit(mut self, staff: StaffId, limit: u32) -> Self {
        self.staff_limits.insert(staff, limit);
        self
    }

    pub fn limit_for(&self, staff: &StaffId, slot: &SlotId) -> u32 {
        self.staff_limits
            .get(staff)
            .or_else(|| self.slot_limits.get(slot))
            .copied()
            .unwrap_or(self.default_limit)
    }
}

impl Default for StaffCapacityPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffAssignment {
    /// Tried in order; the first one under its limit is bound.
    pub candidates: Vec<StaffId>,
    /// Falls back to the appointment's own slot.
    #[serde(default)]
    pub slot_id: Option<SlotId>,
}

#[derive(Clone)]
pub struct AssignmentService {
    stores: BookingStores,
    lifecycle: AppointmentLifecycle,
    capacity: StaffCapacityPolicy,
}

struct Rejection {
    member: StaffMember,
    load: usize,
    limit: u32,
}

impl AssignmentService {
    pub fn new(
        stores: BookingStores,
        lifecycle: AppointmentLifecycle,
        capacity: StaffCapacityPolicy,
    ) -> Self {
        Self {
            stores,
            lifecycle,
            capacity,
        }
    }

    pub fn capacity(&self) -> &StaffCapacityPolicy {
        &self.capacity
    }

    pub fn assign_staff(
        &self,
        appointment_id: &AppointmentId,
        request: StaffAssignment,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        let appointment = self.live_appointment(appointment_id, actor, Action::AssignStaff)?;

        if request.candidates.is_empty() {
            return Err(BookingError::validation(
                "candidates",
                "at least one staff id is required",
            ));
        }
        let slot = request
            .slot_id
            .or_else(|| appointment.slot_id.clone())
            .ok_or_else(|| {
                BookingError::validation("slot_id", "a time slot is required for staff assignment")
            })?;

        if appointment.slot_id.as_ref() == Some(&slot) {
            if let Some(current) = &appointment.staff_id {
                if request.candidates.contains(current) {
                    debug!(appointment_id = %appointment.id, staff_id = %current, "staff already bound");
                    return Ok(Outcome::new(appointment));
                }
            }
        }

        let mut rejected: Vec<Rejection> = Vec::new();
        let mut chosen: Option<StaffMember> = None;
        for candidate in &request.candidates {
            let Some(member) = self.stores.staff.member(candidate)? else {
                if request.candidates.len() == 1 {
                    return Err(BookingError::not_found("staff member", candidate));
                }
                continue;
            };
            if !is_assignable_staff(&member) {
                continue;
            }

            let load = self
                .stores
                .appointments
                .count_for_staff_in_slot(&member.id, &slot)?;
            let limit = self.capacity.limit_for(&member.id, &slot);
            if load < limit as usize {
                chosen = Some(member);
                break;
            }
            debug!(staff_id = %member.id, slot_id = %slot, load, limit, "staff member at capacity");
            rejected.push(Rejection {
                member,
                load,
                limit,
            });
        }

        let Some(member) = chosen else {
            return Err(self.no_capacity(&request.candidates, &slot, rejected)?);
        };

        let now = Utc::now();
        let previous = appointment.staff_id.clone();
        let appointment = self
            .stores
            .appointments
            .set_staff(
                &appointment.id,
                Some(member.id.clone()),
                Some(slot.clone()),
                now,
            )?
            .ok_or_else(|| closed_meanwhile(&appointment.id))?;
        info!(
            appointment_id = %appointment.id,
            staff_id = %member.id,
            slot_id = %slot,
            "staff assigned"
        );

        let mut record = AuditRecord::new(
            AuditSubject::Appointment(appointment.id.clone()),
            "appointment.staff_assigned",
            &actor.id,
            now,
        )
        .detail("staff_id", member.id.to_string())
        .detail("slot_id", slot.to_string());
        if let Some(previous) = previous {
            record = record.detail("replaced_staff_id", previous.to_string());
        }
        let audit = self.lifecycle.trail().record(record);
        Ok(Outcome::new(appointment).with_effect(audit))
    }

    fn no_capacity(
        &self,
        candidates: &[StaffId],
        slot: &SlotId,
        rejected: Vec<Rejection>,
    ) -> Result<BookingError, BookingError> {
        let Some(first) = rejected.first() else {
            return Ok(BookingError::validation(
                "candidates",
                "no candidate is an active staff member",
            ));
        };

        let mut suggestion = None;
        for member in self.stores.staff.roster(slot)? {
            if candidates.contains(&member.id) || !is_assignable_staff(&member) {
                continue;
            }
            let load = self
                .stores
                .appointments
                .count_for_staff_in_slot(&member.id, slot)?;
            let limit = self.capacity.limit_for(&member.id, slot);
            if load < limit as usize {
                suggestion = Some(StaffSuggestion {
                    staff_id: member.id,
                    name: member.name,
                    current_load: load,
                    limit,
                });
                break;
            }
        }

        let mut message = format!(
            "{} ({}) already holds {} of {} appointments in slot {}",
            first.member.name, first.member.id, first.load, first.limit, slot
        );
        if rejected.len() > 1 {
            message.push_str(&format!(
                "; {} other candidates are also full",
                rejected.len() - 1
            ));
        }
        match &suggestion {
            Some(alternative) => message.push_str(&format!(
                "; try {} ({}) instead",
                alternative.name, alternative.staff_id
            )),
            None => message.push_str("; no other staff member in this slot has room"),
        }

        Ok(BookingError::Capacity {
            message,
            suggestion,
        })
    }

    /// Clears the staff binding. The booked slot and the appointment stay.
    pub fn unassign_staff(
        &self,
        appointment_id: &AppointmentId,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        let appointment = self.live_appointment(appointment_id, actor, Action::AssignStaff)?;
        let Some(staff_id) = appointment.staff_id.clone() else {
            return Err(BookingError::validation(
                "staff_id",
                "no staff member is assigned",
            ));
        };

        let now = Utc::now();
        let appointment = self
            .stores
            .appointments
            .set_staff(&appointment.id, None, None, now)?
            .ok_or_else(|| closed_meanwhile(&appointment.id))?;
        info!(appointment_id = %appointment.id, staff_id = %staff_id, "staff unassigned");

        let mut record = AuditRecord::new(
            AuditSubject::Appointment(appointment.id.clone()),
            "appointment.staff_unassigned",
            &actor.id,
            now,
        )
        .detail("staff_id", staff_id.to_string());
        if let Some(slot) = &appointment.slot_id {
            record = record.detail("slot_id", slot.to_string());
        }
        let audit = self.lifecycle.trail().record(record);
        Ok(Outcome::new(appointment).with_effect(audit))
    }

    /// Technicians carry no per-slot ceiling; only existence and role are checked.
    pub fn assign_technician(
        &self,
        appointment_id: &AppointmentId,
        technician_id: &StaffId,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        let appointment = self.live_appointment(appointment_id, actor, Action::AssignTechnician)?;
        let member = self
            .stores
            .staff
            .member(technician_id)?
            .ok_or_else(|| BookingError::not_found("laboratory technician", technician_id))?;
        if member.role != StaffRole::LabTechnician || !member.active {
            return Err(BookingError::validation(
                "laboratory_technician_id",
                format!("{} is not an active laboratory technician", member.id),
            ));
        }

        let now = Utc::now();
        let appointment = self
            .stores
            .appointments
            .set_technician(&appointment.id, Some(member.id.clone()), now)?
            .ok_or_else(|| closed_meanwhile(&appointment.id))?;
        info!(appointment_id = %appointment.id, technician_id = %member.id, "technician assigned");

        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Appointment(appointment.id.clone()),
                "appointment.technician_assigned",
                &actor.id,
                now,
            )
            .detail("laboratory_technician_id", member.id.to_string()),
        );
        Ok(Outcome::new(appointment).with_effect(audit))
    }

    pub fn unassign_technician(
        &self,
        appointment_id: &AppointmentId,
        actor: &Actor,
    ) -> Result<Outcome<Appointment>, BookingError> {
        let appointment = self.live_appointment(appointment_id, actor, Action::AssignTechnician)?;
        let Some(technician) = appointment.laboratory_technician_id.clone() else {
            return Err(BookingError::validation(
                "laboratory_technician_id",
                "no laboratory technician is assigned",
            ));
        };

        let now = Utc::now();
        let appointment = self
            .stores
            .appointments
            .set_technician(&appointment.id, None, now)?
            .ok_or_else(|| closed_meanwhile(&appointment.id))?;
        info!(appointment_id = %appointment.id, technician_id = %technician, "technician unassigned");

        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Appointment(appointment.id.clone()),
                "appointment.technician_unassigned",
                &actor.id,
                now,
            )
            .detail("laboratory_technician_id", technician.to_string()),
        );
        Ok(Outcome::new(appointment).with_effect(audit))
    }

    fn live_appointment(
        &self,
        id: &AppointmentId,
        actor: &Actor,
        action: Action,
    ) -> Result<Appointment, BookingError> {
        let appointment = self.lifecycle.load(id)?;
        self.lifecycle
            .policy()
            .authorize(actor, action, &appointment)
            .into_result()?;
        if appointment.status.is_terminal() {
            return Err(BookingError::Conflict(format!(
                "appointment {} is {}",
                appointment.id, appointment.status
            )));
        }
        Ok(appointment)
    }
}

fn closed_meanwhile(id: &AppointmentId) -> BookingError {
    BookingError::Conflict(format!(
        "appointment {id} was cancelled or completed during the assignment"
    ))
}

fn is_assignable_staff(member: &StaffMember) -> bool {
    member.active && matches!(member.role, StaffRole::Staff | StaffRole::Manager)
}
