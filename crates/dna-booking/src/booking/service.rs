use std::io::Read;

use super::allocation::{AllocationConfig, SampleAllocator};
use super::assignment::{AssignmentService, StaffCapacityPolicy};
use super::lifecycle::AppointmentLifecycle;
use super::payment::PaymentTracker;
use super::provisioning::{import_kits, KitImport, ProvisioningError};
use super::repository::BookingStores;
use super::reservation::{ReservationConfig, ReservationConverter};

/// Every engine default, supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingConfig {
    pub allocation: AllocationConfig,
    pub capacity: StaffCapacityPolicy,
    pub reservations: ReservationConfig,
}

/// Facade composing the lifecycle, allocator, assignment, payment and reservation
/// components over one set of stores.
pub struct BookingService {
    stores: BookingStores,
    lifecycle: AppointmentLifecycle,
    allocator: SampleAllocator,
    assignments: AssignmentService,
    payments: PaymentTracker,
    reservations: ReservationConverter,
}

impl BookingService {
    pub fn new(stores: BookingStores, config: BookingConfig) -> Self {
        let lifecycle = AppointmentLifecycle::new(stores.clone());
        let allocator =
            SampleAllocator::new(stores.clone(), lifecycle.clone(), config.allocation);
        let assignments =
            AssignmentService::new(stores.clone(), lifecycle.clone(), config.capacity);
        let payments = PaymentTracker::new(stores.clone(), lifecycle.clone());
        let reservations =
            ReservationConverter::new(stores.clone(), lifecycle.clone(), config.reservations);

        Self {
            stores,
            lifecycle,
            allocator,
            assignments,
            payments,
            reservations,
        }
    }

    pub fn appointments(&self) -> &AppointmentLifecycle {
        &self.lifecycle
    }

    pub fn samples(&self) -> &SampleAllocator {
        &self.allocator
    }

    pub fn assignments(&self) -> &AssignmentService {
        &self.assignments
    }

    pub fn payments(&self) -> &PaymentTracker {
        &self.payments
    }

    pub fn reservations(&self) -> &ReservationConverter {
        &self.reservations
    }

    /// Load kits from CSV into this service's pool.
    pub fn import_kits<R: Read>(&self, reader: R) -> Result<KitImport, ProvisioningError> {
        import_kits(reader, self.stores.kits.as_ref())
    }
}
