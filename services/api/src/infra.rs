use chrono::Utc;
use dna_booking::booking::{import_kits, parse_roster, BookingService, MemoryBackend};
use dna_booking::error::AppError;
use metrics_exporter_prometheus::PrometheusHandle;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// In-memory backend seeded from the optional kit and roster exports.
pub(crate) fn seeded_backend(
    kits_csv: Option<&Path>,
    staff_csv: Option<&Path>,
) -> Result<MemoryBackend, AppError> {
    let backend = MemoryBackend::default();

    if let Some(path) = staff_csv {
        let members = parse_roster(File::open(path)?)?;
        info!(path = %path.display(), members = members.len(), "staff roster loaded");
        for member in members {
            backend.staff.add(member);
        }
    }

    if let Some(path) = kits_csv {
        let report = import_kits(File::open(path)?, backend.store.as_ref())?;
        if !report.duplicates.is_empty() {
            warn!(
                path = %path.display(),
                duplicates = ?report.duplicates,
                "duplicate kit codes skipped"
            );
        }
    }

    Ok(backend)
}

/// Runs the reservation expiry sweep every `period` until the runtime shuts down.
pub(crate) fn spawn_expiry_sweeper(
    service: Arc<BookingService>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match service.reservations().expire_reservations(Utc::now()) {
                Ok(report) => {
                    let failed = report
                        .side_effects
                        .iter()
                        .filter(|effect| !effect.succeeded())
                        .count();
                    if failed > 0 {
                        warn!(failed, "reservation sweep could not record every expiry");
                    }
                }
                Err(err) => warn!(error = %err, "reservation sweep failed"),
            }
        }
    })
}
