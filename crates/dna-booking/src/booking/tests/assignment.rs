use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::common::*;
use crate::booking::assignment::{StaffAssignment, StaffCapacityPolicy};
use crate::booking::domain::{AppointmentId, AppointmentStatus, SlotId, StaffId, StaffRole};
use crate::booking::error::{BookingError, ErrorKind};
use crate::booking::service::BookingConfig;

fn only(staff: &str) -> StaffAssignment {
    StaffAssignment {
        candidates: vec![StaffId::from(staff)],
        slot_id: None,
    }
}

fn staffed_harness() -> Harness {
    let harness = harness();
    harness
        .backend
        .staff
        .add(staff_member("stf-lan", "Lan", StaffRole::Staff));
    harness
        .backend
        .staff
        .add(staff_member("stf-hoa", "Hoa", StaffRole::Staff));
    harness
}

fn assign(harness: &Harness, id: &AppointmentId, staff: &str) -> Result<(), BookingError> {
    harness
        .service
        .assignments()
        .assign_staff(id, only(staff), &manager())
        .map(|_| ())
}

#[test]
fn full_staff_member_is_rejected_with_an_alternative() {
    let harness = staffed_harness();
    for _ in 0..3 {
        let appointment = harness.book();
        assign(&harness, &appointment.id, "stf-lan").expect("under the limit");
    }

    let fourth = harness.book();
    let err = harness
        .service
        .assignments()
        .assign_staff(&fourth.id, only("stf-lan"), &manager())
        .expect_err("limit reached");

    match err {
        BookingError::Capacity {
            message,
            suggestion,
        } => {
            assert!(message.contains("3 of 3"), "{message}");
            let suggestion = suggestion.expect("an alternative exists");
            assert_eq!(suggestion.staff_id, StaffId::from("stf-hoa"));
            assert_eq!(suggestion.current_load, 0);
            assert_eq!(suggestion.limit, 3);
        }
        other => panic!("expected capacity error, got {other:?}"),
    }

    let stored = harness
        .service
        .appointments()
        .get(&fourth.id, &manager())
        .expect("appointment");
    assert_eq!(stored.staff_id, None);
}

#[test]
fn later_candidates_are_tried_when_the_first_is_full() {
    let mut config = BookingConfig::default();
    config.capacity = StaffCapacityPolicy::new(3).with_staff_limit(StaffId::from("stf-lan"), 1);
    let harness = harness_with(config);
    harness
        .backend
        .staff
        .add(staff_member("stf-lan", "Lan", StaffRole::Staff));
    harness
        .backend
        .staff
        .add(staff_member("stf-hoa", "Hoa", StaffRole::Staff));

    let first = harness.book();
    assign(&harness, &first.id, "stf-lan").expect("first fits");

    let second = harness.book();
    let bound = harness
        .service
        .assignments()
        .assign_staff(
            &second.id,
            StaffAssignment {
                candidates: vec![StaffId::from("stf-lan"), StaffId::from("stf-hoa")],
                slot_id: None,
            },
            &manager(),
        )
        .expect("falls through to the second candidate")
        .into_value();

    assert_eq!(bound.staff_id, Some(StaffId::from("stf-hoa")));
}

#[test]
fn slot_limits_apply_when_no_staff_override_exists() {
    let policy = StaffCapacityPolicy::new(3)
        .with_slot_limit(SlotId::from(SLOT), 5)
        .with_staff_limit(StaffId::from("stf-lan"), 2);

    assert_eq!(policy.limit_for(&StaffId::from("stf-lan"), &SlotId::from(SLOT)), 2);
    assert_eq!(policy.limit_for(&StaffId::from("stf-hoa"), &SlotId::from(SLOT)), 5);
    assert_eq!(
        policy.limit_for(&StaffId::from("stf-hoa"), &SlotId::from("slot-other")),
        3
    );
}

#[test]
fn cancelled_appointments_free_their_slot_capacity() {
    let harness = staffed_harness();
    let mut booked = Vec::new();
    for _ in 0..3 {
        let appointment = harness.book();
        assign(&harness, &appointment.id, "stf-lan").expect("under the limit");
        booked.push(appointment);
    }
    harness
        .service
        .appointments()
        .cancel(&booked[0].id, &customer())
        .expect("cancelled");

    let next = harness.book();
    assign(&harness, &next.id, "stf-lan").expect("capacity freed");
}

#[test]
fn reassigning_the_same_staff_member_is_a_no_op() {
    let harness = staffed_harness();
    let appointment = harness.book();
    assign(&harness, &appointment.id, "stf-lan").expect("assigned");

    let repeat = harness
        .service
        .assignments()
        .assign_staff(&appointment.id, only("stf-lan"), &manager())
        .expect("same binding");

    assert!(repeat.side_effects.is_empty());
    let assigned_entries = harness
        .audit()
        .into_iter()
        .filter(|entry| entry.action == "appointment.staff_assigned")
        .count();
    assert_eq!(assigned_entries, 1);
}

#[test]
fn unassigning_keeps_the_appointment_live() {
    let harness = staffed_harness();
    let appointment = harness.book();
    assign(&harness, &appointment.id, "stf-lan").expect("assigned");

    let cleared = harness
        .service
        .assignments()
        .unassign_staff(&appointment.id, &manager())
        .expect("unassigned")
        .into_value();

    assert_eq!(cleared.staff_id, None);
    assert_eq!(cleared.slot_id, Some(SlotId::from(SLOT)));
    assert_eq!(cleared.status, AppointmentStatus::Pending);
    let unassigned = harness
        .audit()
        .into_iter()
        .find(|entry| entry.action == "appointment.staff_unassigned")
        .expect("unassignment audited");
    assert_eq!(unassigned.details.get("slot_id").map(String::as_str), Some(SLOT));

    // The kept slot is reused when a new member is bound.
    assign(&harness, &appointment.id, "stf-hoa").expect("rebound without a slot");

    let err = harness
        .service
        .assignments()
        .unassign_staff(&appointment.id, &manager())
        .expect_err("nothing to clear");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn unknown_single_candidate_is_not_found() {
    let harness = staffed_harness();
    let appointment = harness.book();

    let err = assign(&harness, &appointment.id, "stf-ghost").expect_err("unknown");

    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn technicians_cannot_be_bound_as_desk_staff() {
    let harness = staffed_harness();
    let appointment = harness.book();

    let err = assign(&harness, &appointment.id, "tech-1").expect_err("wrong role");

    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn technician_binding_checks_role_and_activity() {
    let harness = staffed_harness();
    let mut retired = staff_member("tech-2", "Quang", StaffRole::LabTechnician);
    retired.active = false;
    harness.backend.staff.add(retired);
    let appointment = harness.book();
    let assignments = harness.service.assignments();

    let err = assignments
        .assign_technician(&appointment.id, &StaffId::from("stf-lan"), &manager())
        .expect_err("desk staff");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = assignments
        .assign_technician(&appointment.id, &StaffId::from("tech-2"), &manager())
        .expect_err("inactive");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = assignments
        .assign_technician(&appointment.id, &StaffId::from("tech-9"), &manager())
        .expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let bound = assignments
        .assign_technician(&appointment.id, &StaffId::from("tech-1"), &manager())
        .expect("assigned")
        .into_value();
    assert_eq!(bound.laboratory_technician_id, Some(StaffId::from("tech-1")));

    let cleared = assignments
        .unassign_technician(&appointment.id, &manager())
        .expect("cleared")
        .into_value();
    assert_eq!(cleared.laboratory_technician_id, None);
}

#[test]
fn only_supervisors_assign() {
    let harness = staffed_harness();
    let appointment = harness.book();

    let err = harness
        .service
        .assignments()
        .assign_staff(&appointment.id, only("stf-lan"), &staff())
        .expect_err("desk staff cannot assign");

    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[test]
fn terminal_appointments_take_no_assignment() {
    let harness = staffed_harness();
    let appointment = harness.book();
    harness
        .service
        .appointments()
        .cancel(&appointment.id, &customer())
        .expect("cancelled");

    let err = assign(&harness, &appointment.id, "stf-lan").expect_err("cancelled");

    assert_eq!(err.kind(), ErrorKind::Conflict);
}

/// Harness whose appointment store lets a sample submission and the deposit land between
/// an assignment's read and write once the returned flag is raised.
fn interleaved_harness() -> (Harness, Arc<AtomicBool>) {
    let armed = Arc::new(AtomicBool::new(false));
    let flag = armed.clone();
    let harness = harness_with_stores(move |backend, stores| {
        stores.appointments = Arc::new(AdvancedDuringAssignment {
            inner: backend.store.clone(),
            armed: flag,
            deposit: 150_000,
        });
    });
    harness
        .backend
        .staff
        .add(staff_member("stf-lan", "Lan", StaffRole::Staff));
    harness
        .backend
        .staff
        .add(staff_member("tech-2", "Quang", StaffRole::LabTechnician));
    (harness, armed)
}

#[test]
fn technician_reassignment_keeps_concurrent_status_and_payment() {
    let (harness, armed) = interleaved_harness();
    let appointment = harness.confirmed();
    armed.store(true, Ordering::SeqCst);

    let bound = harness
        .service
        .assignments()
        .assign_technician(&appointment.id, &StaffId::from("tech-2"), &manager())
        .expect("reassigned")
        .into_value();

    assert_eq!(bound.laboratory_technician_id, Some(StaffId::from("tech-2")));
    assert_eq!(bound.status, AppointmentStatus::SampleCollected);
    assert_eq!(bound.amount_paid, 150_000);
    let stored = harness
        .service
        .appointments()
        .get(&appointment.id, &manager())
        .expect("appointment");
    assert_eq!(stored.status, AppointmentStatus::SampleCollected);
    assert_eq!(stored.amount_paid, 150_000);
}

#[test]
fn staff_binding_keeps_concurrent_status_and_payment() {
    let (harness, armed) = interleaved_harness();
    let appointment = harness.confirmed();
    armed.store(true, Ordering::SeqCst);

    assign(&harness, &appointment.id, "stf-lan").expect("assigned");

    let stored = harness
        .service
        .appointments()
        .get(&appointment.id, &manager())
        .expect("appointment");
    assert_eq!(stored.staff_id, Some(StaffId::from("stf-lan")));
    assert_eq!(stored.status, AppointmentStatus::SampleCollected);
    assert_eq!(stored.amount_paid, 150_000);
}
