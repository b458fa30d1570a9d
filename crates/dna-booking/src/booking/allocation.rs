//! Sample allocation against the kit pool, and the sample lifecycle that follows it.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{AuditRecord, Outcome, SideEffectKind, SideEffectReport};
use super::domain::{
    next_id, Appointment, AppointmentId, AppointmentStatus, AuditSubject, Kit, KitId, KitStatus,
    PersonInfo, Sample, SampleId, SampleStatus, SampleType,
};
use super::error::{BookingError, ValidationErrors};
use super::lifecycle::AppointmentLifecycle;
use super::policy::{Action, Actor};
use super::repository::{BookingStores, KitRepository, RepositoryError};
use super::saga::Compensations;

/// Fresh listings tried after a kit in the batch was claimed by a concurrent request.
const CLAIM_ATTEMPTS: usize = 3;

/// Allocator defaults, passed in rather than inferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationConfig {
    /// Used when a request names no sample types.
    pub default_sample_type: SampleType,
    pub max_samples_per_request: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            default_sample_type: SampleType::Saliva,
            max_samples_per_request: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    #[serde(default)]
    pub sample_types: Vec<SampleType>,
    /// One entry per sample type when present.
    #[serde(default)]
    pub person_info: Option<Vec<PersonInfo>>,
    /// Specific kit to use for the first sample.
    #[serde(default)]
    pub kit_id: Option<KitId>,
}

#[derive(Clone)]
pub struct SampleAllocator {
    stores: BookingStores,
    lifecycle: AppointmentLifecycle,
    config: AllocationConfig,
}

impl SampleAllocator {
    pub fn new(
        stores: BookingStores,
        lifecycle: AppointmentLifecycle,
        config: AllocationConfig,
    ) -> Self {
        Self {
            stores,
            lifecycle,
            config,
        }
    }

    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Reserve one kit per requested sample and create the samples bound to them.
    ///
    /// Claims are all-or-nothing: a failed claim returns every kit already claimed in the
    /// batch, and a claim lost to a concurrent request is retried against a fresh listing.
    /// Once sample records start being written, a failed insert returns only the
    /// kit of that sample (plus the claimed kits the loop never reached); samples created
    /// before it stay.
    pub fn allocate(
        &self,
        appointment_id: &AppointmentId,
        request: AllocationRequest,
        actor: &Actor,
    ) -> Result<Outcome<Vec<Sample>>, BookingError> {
        let appointment = self.lifecycle.load(appointment_id)?;
        self.lifecycle
            .policy()
            .authorize(actor, Action::AllocateSamples, &appointment)
            .into_result()?;
        if appointment.status.is_terminal() {
            return Err(BookingError::Conflict(format!(
                "appointment {} is {} and takes no new samples",
                appointment.id, appointment.status
            )));
        }

        let (sample_types, people) = self.validate(request.sample_types, request.person_info)?;
        let kits = self.claim_kits(sample_types.len(), request.kit_id.as_ref())?;

        let now = Utc::now();
        let mut created: Vec<Sample> = Vec::with_capacity(kits.len());
        for (index, kit) in kits.iter().enumerate() {
            let sample = Sample {
                id: SampleId(next_id("smp")),
                appointment_id: appointment.id.clone(),
                kit_id: kit.id.clone(),
                sample_type: sample_types[index],
                collection_method: appointment.kind.collection_method(),
                collection_date: None,
                received_date: None,
                status: SampleStatus::Pending,
                person_info: people.as_ref().map(|people| people[index].clone()),
                created_at: now,
                updated_at: now,
            };

            match self.stores.samples.insert(sample) {
                Ok(stored) => created.push(stored),
                Err(err) => {
                    let mut undo = Compensations::new("sample-creation");
                    for unused in &kits[index..] {
                        let pool = self.stores.kits.clone();
                        let id = unused.id.clone();
                        undo.push(format!("release kit {}", unused.code), move || {
                            release_kit(pool.as_ref(), &id)
                        });
                    }
                    let failures = undo.unwind();
                    warn!(
                        appointment_id = %appointment.id,
                        created = created.len(),
                        compensation_failures = failures,
                        error = %err,
                        "sample creation aborted"
                    );
                    return Err(err.into());
                }
            }
        }

        info!(
            appointment_id = %appointment.id,
            samples = created.len(),
            "samples allocated"
        );

        let sample_ids = created
            .iter()
            .map(|sample| sample.id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let kit_codes = kits
            .iter()
            .map(|kit| kit.code.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Appointment(appointment.id.clone()),
                "samples.allocated",
                &actor.id,
                now,
            )
            .detail("samples", sample_ids)
            .detail("kits", kit_codes),
        );

        Ok(Outcome::new(created).with_effect(audit))
    }

    fn validate(
        &self,
        sample_types: Vec<SampleType>,
        person_info: Option<Vec<PersonInfo>>,
    ) -> Result<(Vec<SampleType>, Option<Vec<PersonInfo>>), BookingError> {
        let mut errors = ValidationErrors::new();

        let sample_types = if sample_types.is_empty() {
            let count = person_info.as_ref().map_or(1, |people| people.len().max(1));
            vec![self.config.default_sample_type; count]
        } else {
            sample_types
        };

        if sample_types.len() > self.config.max_samples_per_request {
            errors.push(
                "sample_types",
                format!(
                    "at most {} samples may be requested at once",
                    self.config.max_samples_per_request
                ),
            );
        }

        if let Some(people) = &person_info {
            if people.len() != sample_types.len() {
                errors.push(
                    "person_info",
                    format!(
                        "{} entries supplied for {} sample types",
                        people.len(),
                        sample_types.len()
                    ),
                );
            }
            for (index, person) in people.iter().enumerate() {
                if person.name.trim().is_empty() {
                    errors.push(format!("person_info[{index}].name"), "must not be empty");
                }
                if let Some(url) = &person.photo_url {
                    if let Err(message) = validate_photo_url(url) {
                        errors.push(format!("person_info[{index}].photo_url"), message);
                    }
                }
            }
        }

        errors.into_result()?;
        Ok((sample_types, person_info))
    }

    fn resolve_kits(
        &self,
        count: usize,
        requested: Option<&KitId>,
    ) -> Result<Vec<Kit>, BookingError> {
        let mut kits = Vec::with_capacity(count);
        if let Some(id) = requested {
            let kit = self
                .stores
                .kits
                .fetch(id)?
                .ok_or_else(|| BookingError::not_found("kit", id))?;
            if kit.status != KitStatus::Available {
                return Err(BookingError::Capacity {
                    message: format!("kit {} is {}", kit.code, kit.status.label()),
                    suggestion: None,
                });
            }
            kits.push(kit);
        }

        let wanted = count - kits.len();
        if wanted > 0 {
            // The requested kit is still available, so it may appear in this listing.
            let pool = self.stores.kits.available(count)?;
            kits.extend(
                pool.into_iter()
                    .filter(|kit| Some(&kit.id) != requested)
                    .take(wanted),
            );
        }

        if kits.len() < count {
            return Err(BookingError::Capacity {
                message: format!(
                    "{} kits requested but only {} available",
                    count,
                    kits.len()
                ),
                suggestion: None,
            });
        }
        Ok(kits)
    }

    /// Resolves and claims `count` kits. Capacity is reported once a fresh listing comes up
    /// short, or after every attempt lost a kit to a concurrent request.
    fn claim_kits(
        &self,
        count: usize,
        requested: Option<&KitId>,
    ) -> Result<Vec<Kit>, BookingError> {
        let mut lost = None;
        for attempt in 1..=CLAIM_ATTEMPTS {
            let kits = self.resolve_kits(count, requested)?;
            match self.claim_all(&kits, attempt)? {
                Claim::Complete => return Ok(kits),
                Claim::Lost(kit) => lost = Some(kit),
            }
        }
        let code = lost.map(|kit| kit.code).unwrap_or_default();
        Err(BookingError::Capacity {
            message: format!("kit {code} was claimed by another request"),
            suggestion: None,
        })
    }

    fn claim_all(&self, kits: &[Kit], attempt: usize) -> Result<Claim, BookingError> {
        let mut claims = Compensations::new("kit-claim");
        for kit in kits {
            let failure = match self.stores.kits.claim(&kit.id) {
                Ok(true) => {
                    let pool = self.stores.kits.clone();
                    let id = kit.id.clone();
                    claims.push(format!("release kit {}", kit.code), move || {
                        release_kit(pool.as_ref(), &id)
                    });
                    continue;
                }
                Ok(false) => None,
                Err(err) => Some(err),
            };

            let released = claims.len();
            let failures = claims.unwind();
            let Some(err) = failure else {
                warn!(
                    kit = %kit.code,
                    attempt,
                    released,
                    compensation_failures = failures,
                    "kit claimed by a concurrent request"
                );
                return Ok(Claim::Lost(kit.clone()));
            };
            warn!(
                kit = %kit.code,
                released,
                compensation_failures = failures,
                error = %err,
                "kit claim failed"
            );
            return Err(err.into());
        }
        claims.commit();
        Ok(Claim::Complete)
    }

    /// Record the collection date of a sample. Repeating the same date is a no-op.
    pub fn submit(
        &self,
        sample_id: &SampleId,
        collection_date: NaiveDate,
        actor: &Actor,
    ) -> Result<Outcome<Sample>, BookingError> {
        let (sample, appointment) = self.load_with_appointment(sample_id)?;
        self.lifecycle
            .policy()
            .authorize(actor, Action::SubmitSample, &appointment)
            .into_result()?;

        if sample.status != SampleStatus::Pending {
            return Err(BookingError::illegal("sample", sample.status, "submitted"));
        }
        match sample.collection_date {
            Some(existing) if existing == collection_date => {
                return Ok(Outcome::new(sample));
            }
            Some(existing) => {
                return Err(BookingError::Conflict(format!(
                    "sample {} was already submitted with collection date {existing}",
                    sample.id
                )));
            }
            None => {}
        }

        let now = Utc::now();
        if collection_date > now.date_naive() {
            return Err(BookingError::validation(
                "collection_date",
                "must not be in the future",
            ));
        }

        let sample = self
            .stores
            .samples
            .set_collection_date(&sample.id, collection_date, now)?
            .ok_or_else(|| changed_meanwhile(&sample.id))?;
        if !self.stores.kits.mark_used(&sample.kit_id)? {
            warn!(sample_id = %sample.id, kit_id = %sample.kit_id, "kit was not assigned when its sample was submitted");
        }
        info!(sample_id = %sample.id, appointment_id = %appointment.id, "sample submitted");

        let mut outcome = Outcome::new(sample.clone()).with_effect(
            self.lifecycle.trail().record(
                AuditRecord::new(
                    AuditSubject::Sample(sample.id.clone()),
                    "sample.submitted",
                    &actor.id,
                    now,
                )
                .detail("collection_date", collection_date.to_string()),
            ),
        );

        if let Some(advanced) = self.lifecycle.advance_from_sample_event(
            &appointment.id,
            AppointmentStatus::SampleCollected,
            actor,
        )? {
            outcome.extend(advanced.side_effects);
        }
        Ok(outcome)
    }

    /// Staff records the laboratory receiving a submitted sample.
    pub fn receive(
        &self,
        sample_id: &SampleId,
        received_date: NaiveDate,
        actor: &Actor,
    ) -> Result<Outcome<Sample>, BookingError> {
        let (sample, appointment) = self.load_with_appointment(sample_id)?;
        self.lifecycle
            .policy()
            .authorize(actor, Action::ReceiveSample, &appointment)
            .into_result()?;

        if sample.status != SampleStatus::Pending {
            return Err(BookingError::illegal(
                "sample",
                sample.status,
                SampleStatus::Received,
            ));
        }
        let collected = sample.collection_date.ok_or_else(|| {
            BookingError::validation("collection_date", "sample has not been submitted yet")
        })?;
        if received_date < collected {
            return Err(BookingError::validation(
                "received_date",
                format!("must not precede collection date {collected}"),
            ));
        }

        let now = Utc::now();
        let previous = sample.status;
        let sample = self
            .stores
            .samples
            .compare_and_set_status(
                &sample.id,
                previous,
                SampleStatus::Received,
                Some(received_date),
                now,
            )?
            .ok_or_else(|| changed_meanwhile(&sample.id))?;
        info!(sample_id = %sample.id, appointment_id = %appointment.id, "sample received");

        let mut outcome = Outcome::new(sample.clone()).with_effect(
            self.lifecycle.trail().record(
                AuditRecord::new(
                    AuditSubject::Sample(sample.id.clone()),
                    "sample.received",
                    &actor.id,
                    now,
                )
                .transition(previous.label(), sample.status.label())
                .detail("received_date", received_date.to_string()),
            ),
        );

        if let Some(advanced) = self.lifecycle.advance_from_sample_event(
            &appointment.id,
            AppointmentStatus::SampleReceived,
            actor,
        )? {
            outcome.extend(advanced.side_effects);
        }
        Ok(outcome)
    }

    /// Laboratory progression (`received -> testing -> completed`) or invalidation from
    /// any non-terminal status. Invalidating a never-submitted sample frees its kit.
    pub fn advance_sample(
        &self,
        sample_id: &SampleId,
        target: SampleStatus,
        actor: &Actor,
    ) -> Result<Outcome<Sample>, BookingError> {
        let (sample, appointment) = self.load_with_appointment(sample_id)?;
        self.lifecycle
            .policy()
            .authorize(actor, Action::AdvanceLab, &appointment)
            .into_result()?;

        if !sample_can_move(sample.status, target) {
            return Err(BookingError::illegal("sample", sample.status, target));
        }

        let now = Utc::now();
        let previous = sample.status;
        let sample = self
            .stores
            .samples
            .compare_and_set_status(&sample.id, previous, target, None, now)?
            .ok_or_else(|| changed_meanwhile(&sample.id))?;
        info!(sample_id = %sample.id, from = %previous, to = %target, "sample status changed");

        let mut outcome = Outcome::new(sample.clone()).with_effect(
            self.lifecycle.trail().record(
                AuditRecord::new(
                    AuditSubject::Sample(sample.id.clone()),
                    "sample.status_changed",
                    &actor.id,
                    now,
                )
                .transition(previous.label(), target.label()),
            ),
        );

        if target == SampleStatus::Invalid && sample.collection_date.is_none() {
            let report = match release_kit(self.stores.kits.as_ref(), &sample.kit_id) {
                Ok(()) => SideEffectReport::ok(SideEffectKind::KitRelease),
                Err(err) => {
                    warn!(kit_id = %sample.kit_id, error = %err, "kit release after invalidation failed");
                    SideEffectReport::failed(SideEffectKind::KitRelease, err.to_string())
                }
            };
            outcome.side_effects.push(report);
        }
        Ok(outcome)
    }

    /// Store the object-storage URL of the sampled person's photo.
    pub fn attach_photo(
        &self,
        sample_id: &SampleId,
        photo_url: &str,
        actor: &Actor,
    ) -> Result<Outcome<Sample>, BookingError> {
        let (sample, appointment) = self.load_with_appointment(sample_id)?;
        self.lifecycle
            .policy()
            .authorize(actor, Action::SubmitSample, &appointment)
            .into_result()?;

        validate_photo_url(photo_url)
            .map_err(|message| BookingError::validation("photo_url", message))?;
        let now = Utc::now();
        let sample = self
            .stores
            .samples
            .set_photo_url(&sample.id, photo_url.trim().to_string(), now)?
            .ok_or_else(|| {
                BookingError::validation("person_info", "sample has no person information")
            })?;

        let audit = self.lifecycle.trail().record(
            AuditRecord::new(
                AuditSubject::Sample(sample.id.clone()),
                "sample.photo_attached",
                &actor.id,
                now,
            )
            .detail("photo_url", photo_url.trim()),
        );
        Ok(Outcome::new(sample).with_effect(audit))
    }

    pub fn samples_for(
        &self,
        appointment_id: &AppointmentId,
        actor: &Actor,
    ) -> Result<Vec<Sample>, BookingError> {
        let appointment = self.lifecycle.get(appointment_id, actor)?;
        Ok(self.stores.samples.for_appointment(&appointment.id)?)
    }

    pub fn kits(&self) -> Result<Vec<Kit>, BookingError> {
        Ok(self.stores.kits.all()?)
    }

    fn load_with_appointment(
        &self,
        sample_id: &SampleId,
    ) -> Result<(Sample, Appointment), BookingError> {
        let sample = self
            .stores
            .samples
            .fetch(sample_id)?
            .ok_or_else(|| BookingError::not_found("sample", sample_id))?;
        let appointment = self.lifecycle.load(&sample.appointment_id)?;
        Ok((sample, appointment))
    }
}

enum Claim {
    Complete,
    Lost(Kit),
}

fn changed_meanwhile(id: &SampleId) -> BookingError {
    BookingError::Conflict(format!(
        "sample {id} was changed by another request; reload and retry"
    ))
}

fn release_kit(pool: &dyn KitRepository, id: &KitId) -> Result<(), RepositoryError> {
    if pool.release(id)? {
        Ok(())
    } else {
        Err(RepositoryError::Conflict)
    }
}

fn sample_can_move(from: SampleStatus, to: SampleStatus) -> bool {
    match (from, to) {
        (SampleStatus::Received, SampleStatus::Testing)
        | (SampleStatus::Testing, SampleStatus::Completed) => true,
        (from, SampleStatus::Invalid) => !from.is_terminal(),
        _ => false,
    }
}

/// Accepts http(s) URLs whose path guesses to an `image/*` type.
pub(crate) fn validate_photo_url(url: &str) -> Result<(), &'static str> {
    let url = url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err("must be an http(s) object-storage URL");
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match mime_guess::from_path(path).first() {
        Some(mime) if mime.type_() == mime_guess::mime::IMAGE => Ok(()),
        _ => Err("must reference an image file"),
    }
}
