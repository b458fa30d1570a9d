use chrono::{Duration, Utc};
use clap::Args;
use dna_booking::booking::{
    import_kits, Actor, AllocationRequest, AppointmentId, AppointmentStatus, AppointmentType,
    BookingConfig, BookingService, MemoryBackend, NewAppointment, NewReservation, OpenPayment,
    Outcome, PaymentMethod, PaymentStageKind, PaymentTarget, PersonInfo, Role, SampleType,
    SlotId, StaffAssignment, StaffId, StaffMember, StaffRole, UserId,
};
use dna_booking::error::AppError;
use std::io::Cursor;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Number of kits to provision in the demo pool.
    #[arg(long, default_value_t = 4)]
    pub(crate) kits: usize,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self { kits: 4 }
    }
}

struct Cast {
    customer: Actor,
    desk: Actor,
    manager: Actor,
    technician: Actor,
}

impl Cast {
    fn new() -> Self {
        Self {
            customer: Actor::new("cus-demo", Role::Customer),
            desk: Actor::new("stf-lan", Role::Staff),
            manager: Actor::new("mgr-an", Role::Manager),
            technician: Actor::new("tech-minh", Role::LabTechnician),
        }
    }
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let backend = demo_backend(args.kits)?;
    let service = BookingService::new(backend.stores(), BookingConfig::default());
    let cast = Cast::new();

    println!("DNA booking engine demo");
    println!("- kit pool: {} available", service.samples().kits()?.len());

    let appointment = walk_appointment(&service, &cast)?;
    walk_reservation(&service, &cast)?;

    let appointment = service.appointments().get(&appointment, &cast.customer)?;
    println!(
        "\nFinal appointment {}: {} | {} | paid {} of {}",
        appointment.id,
        appointment.status,
        appointment.payment_stage.label(),
        appointment.amount_paid,
        appointment.total_amount
    );
    let kits = service.samples().kits()?;
    for kit in &kits {
        println!("  - kit {} ({}): {}", kit.code, kit.id, kit.status.label());
    }
    println!(
        "Audit trail: {} entries | notifications sent: {}",
        backend.audit.entries().len(),
        backend.notifier.events().len()
    );
    Ok(())
}

fn demo_backend(kits: usize) -> Result<MemoryBackend, AppError> {
    let backend = MemoryBackend::default();
    let slot = SlotId::from("slot-am");
    for (id, name, role) in [
        ("stf-lan", "Lan", StaffRole::Staff),
        ("stf-hoa", "Hoa", StaffRole::Staff),
        ("tech-minh", "Minh", StaffRole::LabTechnician),
    ] {
        backend.staff.add(StaffMember {
            id: StaffId::from(id),
            name: name.to_string(),
            role,
            active: true,
            slots: vec![slot.clone()],
        });
    }

    let mut csv = String::from("code\n");
    for index in 1..=kits {
        csv.push_str(&format!("DNA-DEMO-{index:04}\n"));
    }
    import_kits(Cursor::new(csv), backend.store.as_ref())?;
    Ok(backend)
}

fn step<T>(label: &str, outcome: Outcome<T>) -> T {
    let failed = outcome.failed_effects().count();
    if failed == 0 {
        println!("  ok  {label}");
    } else {
        println!("  ok  {label} ({failed} side effects failed)");
    }
    outcome.into_value()
}

fn walk_appointment(service: &BookingService, cast: &Cast) -> Result<AppointmentId, AppError> {
    let today = Utc::now().date_naive();
    println!("\nAppointment journey");

    let appointment = step(
        "customer books a facility paternity test",
        service.appointments().create(
            NewAppointment {
                customer_id: UserId::from("cus-demo"),
                kind: AppointmentType::Facility,
                appointment_date: today + Duration::days(2),
                total_amount: 2_500_000,
                deposit_amount: 750_000,
                slot_id: Some(SlotId::from("slot-am")),
            },
            &cast.customer,
        )?,
    );
    let id = appointment.id;

    step(
        "manager assigns desk staff",
        service.assignments().assign_staff(
            &id,
            StaffAssignment {
                candidates: vec![StaffId::from("stf-lan"), StaffId::from("stf-hoa")],
                slot_id: None,
            },
            &cast.manager,
        )?,
    );
    step(
        "manager binds the laboratory technician",
        service
            .assignments()
            .assign_technician(&id, &StaffId::from("tech-minh"), &cast.manager)?,
    );
    step(
        "desk confirms",
        service
            .appointments()
            .transition(&id, AppointmentStatus::Confirmed, &cast.desk)?,
    );

    for stage in [PaymentStageKind::Deposit, PaymentStageKind::Remaining] {
        let payment = step(
            &format!("customer opens the {stage:?} payment").to_lowercase(),
            service.payments().open_payment(
                OpenPayment {
                    target: PaymentTarget::Appointment(id.clone()),
                    stage,
                    method: PaymentMethod::BankTransfer,
                },
                &cast.customer,
            )?,
        );
        step(
            &format!("desk settles {} for {}", payment.order_code, payment.amount),
            service.payments().complete_payment(&payment.id, &cast.desk)?,
        );
        let due = service.payments().next_due(&id, &cast.customer)?;
        println!(
            "      stage now {} | next due {}",
            due.payment_stage.label(),
            due.amount
        );
    }

    let samples = step(
        "customer registers two participants",
        service.samples().allocate(
            &id,
            AllocationRequest {
                sample_types: vec![SampleType::Saliva, SampleType::Saliva],
                person_info: Some(vec![
                    person("Tran Van Binh", "alleged father"),
                    person("Tran Thi Mai", "child"),
                ]),
                kit_id: None,
            },
            &cast.customer,
        )?,
    );
    for sample in &samples {
        step(
            &format!("sample {} collected", sample.id),
            service.samples().submit(&sample.id, today, &cast.customer)?,
        );
    }
    for sample in &samples {
        step(
            &format!("lab receives sample {}", sample.id),
            service.samples().receive(&sample.id, today, &cast.desk)?,
        );
    }
    for target in [AppointmentStatus::Testing, AppointmentStatus::Completed] {
        step(
            &format!("technician moves to {target}"),
            service
                .appointments()
                .transition(&id, target, &cast.technician)?,
        );
    }
    Ok(id)
}

fn walk_reservation(service: &BookingService, cast: &Cast) -> Result<(), AppError> {
    println!("\nReservation journey");
    let reservation = step(
        "customer reserves an immigration kinship test",
        service.reservations().create_reservation(
            NewReservation {
                customer_id: UserId::from("cus-demo"),
                testing_need: "immigration kinship".to_string(),
                preferred_collection_type: AppointmentType::Facility,
                preferred_date: Utc::now().date_naive() + Duration::days(10),
                total_amount: 4_000_000,
                deposit_amount: 1_000_000,
            },
            &cast.customer,
        )?,
    );
    println!(
        "      held until {}",
        reservation.reservation_expires_at.format("%Y-%m-%d %H:%M")
    );
    step(
        "desk confirms the reservation",
        service
            .reservations()
            .confirm_reservation(&reservation.id, &cast.desk)?,
    );

    for stage in [PaymentStageKind::Deposit, PaymentStageKind::Remaining] {
        let payment = service.payments().open_payment(
            OpenPayment {
                target: PaymentTarget::Reservation(reservation.id.clone()),
                stage,
                method: PaymentMethod::Card,
            },
            &cast.customer,
        )?;
        step(
            &format!("reservation payment {} settled", payment.value.order_code),
            service
                .payments()
                .complete_payment(&payment.value.id, &cast.desk)?,
        );
    }

    let appointment = step(
        "desk converts the reservation",
        service.reservations().convert(&reservation.id, &cast.desk)?,
    );
    println!(
        "      appointment {} created as {} ({})",
        appointment.id,
        appointment.status,
        appointment.payment_stage.label()
    );

    match service.reservations().convert(&reservation.id, &cast.desk) {
        Ok(_) => println!("  !!  second conversion unexpectedly succeeded"),
        Err(err) => println!("  ok  second conversion refused: {err}"),
    }
    Ok(())
}

fn person(name: &str, relationship: &str) -> PersonInfo {
    PersonInfo {
        name: name.to_string(),
        relationship: Some(relationship.to_string()),
        identity_document: None,
        photo_url: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_runs_end_to_end() {
        run_demo(DemoArgs::default()).expect("demo completes");
    }

    #[test]
    fn demo_without_enough_kits_reports_capacity() {
        match run_demo(DemoArgs { kits: 1 }) {
            Err(AppError::Booking(err)) => {
                assert_eq!(err.kind(), dna_booking::booking::ErrorKind::Capacity)
            }
            Err(other) => panic!("expected capacity error, got {other}"),
            Ok(()) => panic!("one kit cannot cover two samples"),
        }
    }
}
