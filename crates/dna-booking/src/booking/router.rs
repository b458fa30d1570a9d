use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::allocation::AllocationRequest;
use super::assignment::StaffAssignment;
use super::domain::{
    AppointmentId, AppointmentStatus, PaymentId, PaymentTarget, ReservationId, SampleId,
    SampleStatus, StaffId,
};
use super::error::{BookingError, ErrorKind};
use super::lifecycle::{NewAdministrativeAppointment, NewAppointment};
use super::payment::OpenPayment;
use super::policy::{Action, Actor, Role};
use super::reservation::NewReservation;
use super::service::BookingService;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Router exposing the booking engine under `/api/v1`.
pub fn booking_router(service: Arc<BookingService>) -> Router {
    Router::new()
        .route("/api/v1/appointments", post(create_appointment))
        .route(
            "/api/v1/appointments/administrative",
            post(create_administrative),
        )
        .route("/api/v1/appointments/:appointment_id", get(get_appointment))
        .route(
            "/api/v1/appointments/:appointment_id/transitions",
            post(transition_appointment),
        )
        .route(
            "/api/v1/appointments/:appointment_id/cancel",
            post(cancel_appointment),
        )
        .route(
            "/api/v1/appointments/:appointment_id/samples",
            post(allocate_samples).get(list_samples),
        )
        .route(
            "/api/v1/appointments/:appointment_id/staff",
            post(assign_staff).delete(unassign_staff),
        )
        .route(
            "/api/v1/appointments/:appointment_id/technician",
            post(assign_technician).delete(unassign_technician),
        )
        .route(
            "/api/v1/appointments/:appointment_id/payments",
            get(list_payments),
        )
        .route(
            "/api/v1/appointments/:appointment_id/payments/next",
            get(next_payment),
        )
        .route("/api/v1/samples/:sample_id/submit", post(submit_sample))
        .route("/api/v1/samples/:sample_id/receive", post(receive_sample))
        .route("/api/v1/samples/:sample_id/status", post(advance_sample))
        .route("/api/v1/samples/:sample_id/photo", post(attach_photo))
        .route("/api/v1/kits", get(list_kits))
        .route("/api/v1/payments", post(open_payment))
        .route(
            "/api/v1/payments/:payment_id/complete",
            post(complete_payment),
        )
        .route("/api/v1/payments/:payment_id/fail", post(fail_payment))
        .route("/api/v1/payments/:payment_id/cancel", post(cancel_payment))
        .route("/api/v1/reservations", post(create_reservation))
        .route("/api/v1/reservations/expire", post(expire_reservations))
        .route("/api/v1/reservations/:reservation_id", get(get_reservation))
        .route(
            "/api/v1/reservations/:reservation_id/confirm",
            post(confirm_reservation),
        )
        .route(
            "/api/v1/reservations/:reservation_id/cancel",
            post(cancel_reservation),
        )
        .route(
            "/api/v1/reservations/:reservation_id/convert",
            post(convert_reservation),
        )
        .with_state(service)
}

type Shared = State<Arc<BookingService>>;

#[derive(Debug, Deserialize)]
pub(crate) struct TransitionRequest {
    status: AppointmentStatus,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitSampleRequest {
    collection_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReceiveSampleRequest {
    received_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SampleStatusRequest {
    status: SampleStatus,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PhotoRequest {
    photo_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TechnicianRequest {
    technician_id: StaffId,
}

pub(crate) async fn create_appointment(
    State(service): Shared,
    headers: HeaderMap,
    axum::Json(request): axum::Json<NewAppointment>,
) -> Response {
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.appointments().create(request, actor)
    })
}

pub(crate) async fn create_administrative(
    State(service): Shared,
    headers: HeaderMap,
    axum::Json(request): axum::Json<NewAdministrativeAppointment>,
) -> Response {
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.appointments().create_administrative(request, actor)
    })
}

pub(crate) async fn get_appointment(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.appointments().get(&id, actor)
    })
}

pub(crate) async fn transition_appointment(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
    axum::Json(request): axum::Json<TransitionRequest>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.appointments().transition(&id, request.status, actor)
    })
}

pub(crate) async fn cancel_appointment(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.appointments().cancel(&id, actor)
    })
}

pub(crate) async fn allocate_samples(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
    axum::Json(request): axum::Json<AllocationRequest>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.samples().allocate(&id, request, actor)
    })
}

pub(crate) async fn list_samples(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.samples().samples_for(&id, actor)
    })
}

pub(crate) async fn assign_staff(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
    axum::Json(request): axum::Json<StaffAssignment>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.assignments().assign_staff(&id, request, actor)
    })
}

pub(crate) async fn unassign_staff(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.assignments().unassign_staff(&id, actor)
    })
}

pub(crate) async fn assign_technician(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
    axum::Json(request): axum::Json<TechnicianRequest>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service
            .assignments()
            .assign_technician(&id, &request.technician_id, actor)
    })
}

pub(crate) async fn unassign_technician(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.assignments().unassign_technician(&id, actor)
    })
}

pub(crate) async fn list_payments(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response {
    let target = PaymentTarget::Appointment(AppointmentId(appointment_id));
    with_actor(&headers, StatusCode::OK, |actor| {
        service.payments().payments_for(&target, actor)
    })
}

pub(crate) async fn next_payment(
    State(service): Shared,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response {
    let id = AppointmentId(appointment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.payments().next_due(&id, actor)
    })
}

pub(crate) async fn submit_sample(
    State(service): Shared,
    headers: HeaderMap,
    Path(sample_id): Path<String>,
    axum::Json(request): axum::Json<SubmitSampleRequest>,
) -> Response {
    let id = SampleId(sample_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service
            .samples()
            .submit(&id, request.collection_date, actor)
    })
}

pub(crate) async fn receive_sample(
    State(service): Shared,
    headers: HeaderMap,
    Path(sample_id): Path<String>,
    axum::Json(request): axum::Json<ReceiveSampleRequest>,
) -> Response {
    let id = SampleId(sample_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.samples().receive(&id, request.received_date, actor)
    })
}

pub(crate) async fn advance_sample(
    State(service): Shared,
    headers: HeaderMap,
    Path(sample_id): Path<String>,
    axum::Json(request): axum::Json<SampleStatusRequest>,
) -> Response {
    let id = SampleId(sample_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.samples().advance_sample(&id, request.status, actor)
    })
}

pub(crate) async fn attach_photo(
    State(service): Shared,
    headers: HeaderMap,
    Path(sample_id): Path<String>,
    axum::Json(request): axum::Json<PhotoRequest>,
) -> Response {
    let id = SampleId(sample_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.samples().attach_photo(&id, &request.photo_url, actor)
    })
}

pub(crate) async fn list_kits(State(service): Shared, headers: HeaderMap) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service
            .appointments()
            .policy()
            .authorize_global(actor, Action::AllocateSamples)
            .into_result()?;
        service.samples().kits()
    })
}

pub(crate) async fn open_payment(
    State(service): Shared,
    headers: HeaderMap,
    axum::Json(request): axum::Json<OpenPayment>,
) -> Response {
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.payments().open_payment(request, actor)
    })
}

pub(crate) async fn complete_payment(
    State(service): Shared,
    headers: HeaderMap,
    Path(payment_id): Path<String>,
) -> Response {
    let id = PaymentId(payment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.payments().complete_payment(&id, actor)
    })
}

pub(crate) async fn fail_payment(
    State(service): Shared,
    headers: HeaderMap,
    Path(payment_id): Path<String>,
) -> Response {
    let id = PaymentId(payment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.payments().fail_payment(&id, actor)
    })
}

pub(crate) async fn cancel_payment(
    State(service): Shared,
    headers: HeaderMap,
    Path(payment_id): Path<String>,
) -> Response {
    let id = PaymentId(payment_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.payments().cancel_payment(&id, actor)
    })
}

pub(crate) async fn create_reservation(
    State(service): Shared,
    headers: HeaderMap,
    axum::Json(request): axum::Json<NewReservation>,
) -> Response {
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.reservations().create_reservation(request, actor)
    })
}

pub(crate) async fn get_reservation(
    State(service): Shared,
    headers: HeaderMap,
    Path(reservation_id): Path<String>,
) -> Response {
    let id = ReservationId(reservation_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.reservations().get_reservation(&id, actor)
    })
}

pub(crate) async fn confirm_reservation(
    State(service): Shared,
    headers: HeaderMap,
    Path(reservation_id): Path<String>,
) -> Response {
    let id = ReservationId(reservation_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.reservations().confirm_reservation(&id, actor)
    })
}

pub(crate) async fn cancel_reservation(
    State(service): Shared,
    headers: HeaderMap,
    Path(reservation_id): Path<String>,
) -> Response {
    let id = ReservationId(reservation_id);
    with_actor(&headers, StatusCode::OK, |actor| {
        service.reservations().cancel_reservation(&id, actor)
    })
}

pub(crate) async fn convert_reservation(
    State(service): Shared,
    headers: HeaderMap,
    Path(reservation_id): Path<String>,
) -> Response {
    let id = ReservationId(reservation_id);
    with_actor(&headers, StatusCode::CREATED, |actor| {
        service.reservations().convert(&id, actor)
    })
}

pub(crate) async fn expire_reservations(State(service): Shared, headers: HeaderMap) -> Response {
    with_actor(&headers, StatusCode::OK, |actor| {
        service
            .appointments()
            .policy()
            .authorize_global(actor, Action::ManageReservation)
            .into_result()?;
        service.reservations().expire_reservations(Utc::now())
    })
}

/// Caller identity asserted by the upstream authorization boundary.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, String> {
    let id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing {ACTOR_ID_HEADER} header"))?;
    let raw_role = headers
        .get(ACTOR_ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| format!("missing {ACTOR_ROLE_HEADER} header"))?;
    let role = Role::parse(raw_role).ok_or_else(|| format!("unknown role `{raw_role}`"))?;
    Ok(Actor::new(id, role))
}

fn with_actor<T, F>(headers: &HeaderMap, status: StatusCode, operation: F) -> Response
where
    T: Serialize,
    F: FnOnce(&Actor) -> Result<T, BookingError>,
{
    let actor = match actor_from_headers(headers) {
        Ok(actor) => actor,
        Err(message) => {
            let payload = json!({ "error": message });
            return (StatusCode::UNAUTHORIZED, axum::Json(payload)).into_response();
        }
    };

    match operation(&actor) {
        Ok(value) => (status, axum::Json(value)).into_response(),
        Err(err) => error_response(err),
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::IllegalTransition => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Capacity | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON body: `error` and `kind`, plus `fields` for validation failures and `suggestion`
/// for capacity failures that found an alternative.
pub fn error_response(err: BookingError) -> Response {
    let kind = err.kind();
    let mut payload = json!({
        "error": err.to_string(),
        "kind": kind,
    });
    match &err {
        BookingError::Validation(errors) => {
            payload["fields"] = json!(errors.fields());
        }
        BookingError::Capacity {
            suggestion: Some(suggestion),
            ..
        } => {
            payload["suggestion"] = json!(suggestion);
        }
        BookingError::IllegalTransition { from, to, .. } => {
            payload["current_status"] = json!(from);
            payload["requested_status"] = json!(to);
        }
        _ => {}
    }
    (status_for(kind), axum::Json(payload)).into_response()
}
