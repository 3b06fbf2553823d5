//! Portal entry points.
//!
//! `ClinicPortal` is what the views talk to. It owns the shared `SessionManager`, the document
//! store handle and one `SubscriptionHub`, so every live list opened through the same portal
//! shares upstream feeds. Each mutation asks the `PermissionGate` first; a denial returns
//! `PermissionDenied` without any store call.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{CollectionNames, PortalConfig};
use crate::error::{AppError, AppResult};
use crate::identity::{
    decide, Action, FileSessionCache, GuardDecision, Identity, MemorySessionCache, PermissionGate, Role, Session, SessionManager,
    SharedIdentityProvider, SharedSessionCache,
};
use crate::realtime::{CollectionEvent, RealtimeCollection, Snapshot, Stored, SubscriptionHandle, SubscriptionHub};
use crate::records::{
    now_ms, Appointment, AppointmentDraft, AppointmentStatus, DashboardStats, MedicalEvent, Patient, PatientDraft, UserProfile,
};
use crate::storage::{to_fields, Fields, Filter, OrderSpec, Query, SharedDocumentStore};

pub struct ClinicPortal {
    session: Arc<SessionManager>,
    store: SharedDocumentStore,
    hub: SubscriptionHub,
    collections: CollectionNames,
}

impl ClinicPortal {
    pub fn new(
        provider: SharedIdentityProvider,
        store: SharedDocumentStore,
        cache: SharedSessionCache,
        collections: CollectionNames,
    ) -> Self {
        let session = SessionManager::new(provider, Arc::clone(&store), cache, collections.users.clone());
        Self { session, store, hub: SubscriptionHub::new(), collections }
    }

    /// Build from configuration: a file-backed session cache when `cache_path` is set,
    /// otherwise an in-memory one.
    pub fn from_config(config: &PortalConfig, provider: SharedIdentityProvider, store: SharedDocumentStore) -> Self {
        let cache: SharedSessionCache = match &config.cache_path {
            Some(path) => Arc::new(FileSessionCache::new(path.clone(), config.cache_key.clone())),
            None => Arc::new(MemorySessionCache::new()),
        };
        Self::new(provider, store, cache, config.collections.clone())
    }

    /// Restore the cached session and start following the identity provider.
    pub fn start(&self) { self.session.start(); }

    pub fn session(&self) -> &Arc<SessionManager> { &self.session }

    pub fn current_session(&self) -> Session { self.session.current() }

    pub fn hub(&self) -> &SubscriptionHub { &self.hub }

    pub fn collections(&self) -> &CollectionNames { &self.collections }

    // ---- authentication ----

    /// Authenticate with the identity provider. The session follows through the provider's
    /// change feed; this call does not wait for role resolution.
    pub async fn sign_in(&self, email: &str, secret: &str) -> AppResult<Identity> {
        let identity = self.session.provider().sign_in(email, secret).await.map_err(AppError::from)?;
        info!(target: "clinic::portal", "signed in id={}", identity.id);
        Ok(identity)
    }

    pub async fn sign_out(&self) -> AppResult<()> { self.session.sign_out().await }

    /// Create an identity and its directory entry. The new account is signed in; its session
    /// shows a pending role until the entry is written, after which the lookup is re-run.
    /// A patient account also gets its own record at `patients/{identity id}`.
    pub async fn register_account(&self, name: &str, email: &str, secret: &str, role: Role) -> AppResult<Identity> {
        if name.trim().is_empty() {
            return Err(AppError::user("name_required", "display name is required"));
        }
        let identity = self.session.provider().sign_up(email, secret).await.map_err(AppError::from)?;
        let profile = UserProfile {
            uid: identity.id.clone(),
            name: name.trim().to_string(),
            email: identity.email.clone(),
            role: role.as_str().to_string(),
            created_at: now_ms(),
        };
        if role == Role::Patient {
            let record = Patient { name: profile.name.clone(), created_at: profile.created_at, ..Patient::default() };
            self.store.set(&self.collections.patients, &identity.id, to_fields(&record)?).await?;
            debug!(target: "clinic::portal", "seeded patient record id={}", identity.id);
        }
        self.store.set(&self.collections.users, &identity.id, to_fields(&profile)?).await?;
        info!(target: "clinic::portal", "registered id={} role={}", identity.id, role);
        if self.session.current().identity_id() == Some(identity.id.as_str()) {
            self.session.retry();
        }
        Ok(identity)
    }

    // ---- appointments ----

    fn appointments(&self) -> RealtimeCollection<Appointment> { RealtimeCollection::with_hub(Arc::clone(&self.store), self.hub.clone()) }

    pub fn appointments_key(&self) -> Query { Query::new(self.collections.appointments.clone(), OrderSpec::desc("createdAt")) }

    /// Book an appointment for `on_behalf_of`, or for the signed-in user when `None`.
    pub async fn book_appointment(&self, draft: AppointmentDraft, on_behalf_of: Option<&str>) -> AppResult<String> {
        let session = self.session.current();
        let actor = session.identity_id().unwrap_or_default().to_string();
        let owner = on_behalf_of.map(str::to_string).unwrap_or_else(|| actor.clone());
        PermissionGate::check(&session, Action::CreateAppointment, Some(owner.as_str()))?;
        if matches!(draft.status, Some(s) if s != AppointmentStatus::Pending) {
            PermissionGate::check(&session, Action::ChangeAppointmentStatus, None)?;
        }
        draft.validate()?;

        let appointment = draft.into_appointment(&owner, now_ms());
        let id = self.store.add(&self.collections.appointments, to_fields(&appointment)?).await?;
        info!(
            target: "clinic::portal",
            "booked appointment {} for owner={} by={} status={}",
            id, owner, actor, appointment.status
        );
        Ok(id)
    }

    pub async fn change_appointment_status(&self, id: &str, status: AppointmentStatus) -> AppResult<()> {
        let session = self.session.current();
        PermissionGate::check(&session, Action::ChangeAppointmentStatus, None)?;
        let mut partial = Fields::new();
        partial.insert("status".to_string(), json!(status.as_str()));
        self.store.update(&self.collections.appointments, id, partial).await?;
        info!(target: "clinic::portal", "appointment {} -> {}", id, status);
        Ok(())
    }

    pub async fn delete_appointment(&self, id: &str) -> AppResult<()> {
        PermissionGate::check(&self.session.current(), Action::DeleteAppointment, None)?;
        self.store.delete(&self.collections.appointments, id).await?;
        info!(target: "clinic::portal", "deleted appointment {}", id);
        Ok(())
    }

    /// Live appointment list, newest first.
    pub fn watch_appointments<F>(&self, callback: F) -> AppResult<SubscriptionHandle>
    where
        F: FnMut(CollectionEvent<Appointment>) + Send + 'static,
    {
        self.require_signed_in()?;
        self.appointments().subscribe(self.appointments_key(), callback)
    }

    // ---- patients ----

    fn patients(&self) -> RealtimeCollection<Patient> { RealtimeCollection::with_hub(Arc::clone(&self.store), self.hub.clone()) }

    pub fn patients_key(&self) -> Query { Query::new(self.collections.patients.clone(), OrderSpec::desc("createdAt")) }

    pub async fn register_patient(&self, draft: PatientDraft) -> AppResult<String> {
        PermissionGate::check(&self.session.current(), Action::CreatePatient, None)?;
        draft.validate()?;
        let patient = draft.into_patient(now_ms());
        let id = self.store.add(&self.collections.patients, to_fields(&patient)?).await?;
        info!(target: "clinic::portal", "registered patient {}", id);
        Ok(id)
    }

    /// Replace the editable fields of a patient; `createdAt` is kept.
    pub async fn update_patient(&self, id: &str, draft: PatientDraft) -> AppResult<()> {
        PermissionGate::check(&self.session.current(), Action::UpdatePatient, None)?;
        draft.validate()?;
        let mut partial = to_fields(&draft)?;
        partial.insert("name".to_string(), json!(draft.name.trim()));
        self.store.update(&self.collections.patients, id, partial).await?;
        debug!(target: "clinic::portal", "updated patient {}", id);
        Ok(())
    }

    pub async fn delete_patient(&self, id: &str) -> AppResult<()> {
        PermissionGate::check(&self.session.current(), Action::DeletePatient, None)?;
        self.store.delete(&self.collections.patients, id).await?;
        info!(target: "clinic::portal", "deleted patient {}", id);
        Ok(())
    }

    /// Live patient list, newest first.
    pub fn watch_patients<F>(&self, callback: F) -> AppResult<SubscriptionHandle>
    where
        F: FnMut(CollectionEvent<Patient>) + Send + 'static,
    {
        self.require_signed_in()?;
        self.patients().subscribe(self.patients_key(), callback)
    }

    /// One-shot patient list, e.g. for a booking form.
    pub async fn list_patients(&self) -> AppResult<Snapshot<Patient>> {
        self.require_signed_in()?;
        self.patients().fetch(&self.patients_key()).await
    }

    // ---- patient profile ----

    /// Point read of one patient. The patient record id is the resource owner; a patient
    /// account's own record lives under its identity id (seeded by `register_account`).
    pub async fn patient_profile(&self, patient_id: &str) -> AppResult<Stored<Patient>> {
        PermissionGate::check(&self.session.current(), Action::ViewOwnRecord, Some(patient_id))?;
        self.patients().read_once(&self.collections.patients, patient_id).await
    }

    pub fn timeline_key(&self, patient_id: &str) -> Query {
        Query::new(self.collections.medical_history.clone(), OrderSpec::desc("timestamp")).with_filter(Filter::eq("patientId", patient_id))
    }

    /// Live medical history of one patient, newest first.
    pub fn watch_patient_timeline<F>(&self, patient_id: &str, callback: F) -> AppResult<SubscriptionHandle>
    where
        F: FnMut(CollectionEvent<MedicalEvent>) + Send + 'static,
    {
        PermissionGate::check(&self.session.current(), Action::ViewOwnRecord, Some(patient_id))?;
        let timeline: RealtimeCollection<MedicalEvent> = RealtimeCollection::with_hub(Arc::clone(&self.store), self.hub.clone());
        timeline.subscribe(self.timeline_key(patient_id), callback)
    }

    // ---- directory ----

    pub async fn list_doctors(&self) -> AppResult<Snapshot<UserProfile>> {
        self.require_signed_in()?;
        let users: RealtimeCollection<UserProfile> = RealtimeCollection::with_hub(Arc::clone(&self.store), self.hub.clone());
        users.fetch(&self.doctors_key()).await
    }

    fn doctors_key(&self) -> Query {
        Query::new(self.collections.users.clone(), OrderSpec::asc("name")).with_filter(Filter::eq("role", Role::Doctor.as_str()))
    }

    /// Counts for the admin landing area.
    pub async fn dashboard_stats(&self) -> AppResult<DashboardStats> {
        let session = self.session.current();
        if decide(&session, Some(Role::Admin)) != GuardDecision::Render {
            return Err(AppError::denied("permission_denied", "the dashboard is restricted to administrators"));
        }
        let patients = self.store.list(&self.patients_key()).await?.len();
        let doctors = self.store.list(&self.doctors_key()).await?.len();
        let appointments = self.store.list(&self.appointments_key()).await?.len();
        Ok(DashboardStats { patients, doctors, appointments })
    }

    fn require_signed_in(&self) -> AppResult<()> {
        let session = self.session.current();
        if !session.is_authenticated() {
            warn!(target: "clinic::portal", "live data requested without a session");
            return Err(AppError::auth("not_signed_in", "sign in to view this page"));
        }
        Ok(())
    }
}
