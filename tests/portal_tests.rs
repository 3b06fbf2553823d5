//! Portal integration tests: gated mutations, live lists and admin-only views.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use clinic_portal::config::CollectionNames;
use clinic_portal::identity::{Identity, LocalIdentityProvider, MemorySessionCache, Role, SessionStatus};
use clinic_portal::realtime::{CollectionEvent, Snapshot};
use clinic_portal::records::{AppointmentDraft, AppointmentStatus, PatientDraft};
use clinic_portal::storage::{to_fields, Document, DocumentStore, Fields, MemoryDocumentStore, Query, StoreFeed};
use clinic_portal::{AppError, AppResult, ClinicPortal};

/// Counts every mutating call that reaches the store.
struct CountingStore {
    inner: MemoryDocumentStore,
    writes: AtomicUsize,
}

impl CountingStore {
    fn writes(&self) -> usize { self.writes.load(Ordering::SeqCst) }
    fn bump(&self) { self.writes.fetch_add(1, Ordering::SeqCst); }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn get(&self, collection: &str, id: &str) -> AppResult<Document> { self.inner.get(collection, id).await }
    async fn list(&self, query: &Query) -> AppResult<Vec<Document>> { self.inner.list(query).await }
    async fn add(&self, collection: &str, fields: Fields) -> AppResult<String> {
        self.bump();
        self.inner.add(collection, fields).await
    }
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> AppResult<()> {
        self.bump();
        self.inner.set(collection, id, fields).await
    }
    async fn update(&self, collection: &str, id: &str, partial: Fields) -> AppResult<()> {
        self.bump();
        self.inner.update(collection, id, partial).await
    }
    async fn delete(&self, collection: &str, id: &str) -> AppResult<()> {
        self.bump();
        self.inner.delete(collection, id).await
    }
    fn subscribe(&self, query: &Query) -> AppResult<StoreFeed> { self.inner.subscribe(query) }
}

struct Clinic {
    provider: Arc<LocalIdentityProvider>,
    mem: MemoryDocumentStore,
    store: Arc<CountingStore>,
    portal: ClinicPortal,
}

impl Clinic {
    fn new() -> Self {
        let provider = Arc::new(LocalIdentityProvider::new());
        let mem = MemoryDocumentStore::new();
        let store = Arc::new(CountingStore { inner: mem.clone(), writes: AtomicUsize::new(0) });
        let portal = ClinicPortal::new(provider.clone(), store.clone(), Arc::new(MemorySessionCache::new()), CollectionNames::default());
        portal.start();
        Self { provider, mem, store, portal }
    }

    /// Seed an account plus directory entry without going through the portal.
    async fn account(&self, email: &str, role: Role) -> Identity {
        let id = self.provider.seed_account(email, "pw").unwrap();
        let fields = to_fields(&json!({"uid": id.id, "email": email, "name": email, "role": role.as_str()})).unwrap();
        self.mem.set("users", &id.id, fields).await.unwrap();
        id
    }

    /// Sign in and wait for the verified session.
    async fn login(&self, email: &str) {
        let (_sub, mut rx) = self.portal.session().watch();
        self.portal.sign_in(email, "pw").await.unwrap();
        loop {
            let s = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            if s.is_verified() && s.identity.as_ref().map(|i| i.email.as_str()) == Some(email) {
                return;
            }
        }
    }

    async fn as_new(&self, email: &str, role: Role) -> Identity {
        let id = self.account(email, role).await;
        self.login(email).await;
        id
    }
}

fn draft(patient: &str) -> AppointmentDraft {
    AppointmentDraft {
        patient_name: patient.to_string(),
        doctor_id: "doc-1".to_string(),
        doctor_name: "Dr. Who".to_string(),
        date: "2026-03-01".to_string(),
        time: "10:00".to_string(),
        reason: "checkup".to_string(),
        status: None,
    }
}

#[tokio::test]
async fn receptionist_booking_defaults_to_pending() -> Result<()> {
    let c = Clinic::new();
    let rec = c.as_new("rec@example.com", Role::Receptionist).await;

    let id = c.portal.book_appointment(draft("Ali"), None).await?;
    let doc = c.mem.get("appointments", &id).await?;
    assert_eq!(doc.get("status"), Some(&json!("pending")));
    assert_eq!(doc.get("bookedBy"), Some(&json!(rec.id)));
    assert!(doc.get("createdAt").and_then(|v| v.as_i64()).unwrap_or(0) > 0);

    let on_behalf = c.portal.book_appointment(draft("Sara"), Some("patient-9")).await?;
    assert_eq!(c.mem.get("appointments", &on_behalf).await?.get("bookedBy"), Some(&json!("patient-9")));
    Ok(())
}

#[tokio::test]
async fn doctor_completes_and_patient_is_refused_without_a_write() -> Result<()> {
    let c = Clinic::new();
    c.account("rec@example.com", Role::Receptionist).await;
    c.account("doc@example.com", Role::Doctor).await;
    c.account("pat@example.com", Role::Patient).await;

    c.login("rec@example.com").await;
    let id = c.portal.book_appointment(draft("Ali"), None).await?;
    c.portal.sign_out().await?;

    c.login("doc@example.com").await;
    c.portal.change_appointment_status(&id, AppointmentStatus::Completed).await?;
    assert_eq!(c.mem.get("appointments", &id).await?.get("status"), Some(&json!("completed")));
    c.portal.sign_out().await?;

    c.login("pat@example.com").await;
    let before = c.store.writes();
    let err = c.portal.change_appointment_status(&id, AppointmentStatus::Cancelled).await.unwrap_err();
    assert!(err.is_permission_denied());
    assert_eq!(c.store.writes(), before);
    assert_eq!(c.mem.get("appointments", &id).await?.get("status"), Some(&json!("completed")));
    Ok(())
}

#[tokio::test]
async fn patient_books_only_for_self_and_sees_own_profile() -> Result<()> {
    let c = Clinic::new();
    let me = c.as_new("pat@example.com", Role::Patient).await;
    c.mem.set("patients", &me.id, to_fields(&json!({"name": "Pat", "createdAt": 1}))?).await?;
    c.mem.set("patients", "someone-else", to_fields(&json!({"name": "Other", "createdAt": 2}))?).await?;

    let own = c.portal.book_appointment(draft("Pat"), None).await?;
    assert_eq!(c.mem.get("appointments", &own).await?.get("bookedBy"), Some(&json!(me.id)));

    let before = c.store.writes();
    let err = c.portal.book_appointment(draft("Other"), Some("someone-else")).await.unwrap_err();
    assert!(err.is_permission_denied());
    let mut confirmed = draft("Pat");
    confirmed.status = Some(AppointmentStatus::Confirmed);
    assert!(c.portal.book_appointment(confirmed, None).await.unwrap_err().is_permission_denied());
    assert_eq!(c.store.writes(), before);

    assert_eq!(c.portal.patient_profile(&me.id).await?.record.name, "Pat");
    assert!(c.portal.patient_profile("someone-else").await.unwrap_err().is_permission_denied());
    assert!(c.portal.delete_appointment(&own).await.unwrap_err().is_permission_denied());
    Ok(())
}

#[tokio::test]
async fn receptionist_manages_patients_doctor_cannot() -> Result<()> {
    let c = Clinic::new();
    c.account("rec@example.com", Role::Receptionist).await;
    c.account("doc@example.com", Role::Doctor).await;

    c.login("rec@example.com").await;
    let bad = c.portal.register_patient(PatientDraft { name: "  ".into(), ..Default::default() }).await.unwrap_err();
    assert!(matches!(bad, AppError::UserInput { .. }));

    let id = c
        .portal
        .register_patient(PatientDraft { name: "Ali".into(), age: Some(40), disease: "flu".into(), ..Default::default() })
        .await?;
    let created_at = c.mem.get("patients", &id).await?.get("createdAt").cloned();
    c.portal
        .update_patient(&id, PatientDraft { name: "Ali Khan".into(), age: Some(41), disease: "flu".into(), ..Default::default() })
        .await?;
    let doc = c.mem.get("patients", &id).await?;
    assert_eq!(doc.get("name"), Some(&json!("Ali Khan")));
    assert_eq!(doc.get("createdAt").cloned(), created_at);
    assert_eq!(c.portal.list_patients().await?.len(), 1);
    c.portal.sign_out().await?;

    c.login("doc@example.com").await;
    let before = c.store.writes();
    assert!(c.portal.delete_patient(&id).await.unwrap_err().is_permission_denied());
    assert!(c.portal.register_patient(PatientDraft { name: "X".into(), ..Default::default() }).await.unwrap_err().is_permission_denied());
    assert_eq!(c.store.writes(), before);
    c.portal.sign_out().await?;

    c.login("rec@example.com").await;
    c.portal.delete_patient(&id).await?;
    assert!(c.mem.is_empty("patients"));
    Ok(())
}

async fn next_snapshot<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<CollectionEvent<T>>) -> Snapshot<T> {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(CollectionEvent::Snapshot(s))) => s,
        other => panic!("expected snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn live_appointment_list_follows_bookings() -> Result<()> {
    let c = Clinic::new();
    assert!(matches!(c.portal.watch_appointments(|_| {}).err(), Some(AppError::Auth { .. })));

    c.as_new("rec@example.com", Role::Receptionist).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = c.portal.watch_appointments(move |ev| {
        let _ = tx.send(ev);
    })?;

    assert!(next_snapshot(&mut rx).await.is_empty());
    let first = c.portal.book_appointment(draft("Ali"), None).await?;
    assert_eq!(next_snapshot(&mut rx).await.ids(), vec![first.as_str()]);

    handle.dispose();
    assert_eq!(c.portal.hub().upstream_count(), 0);
    Ok(())
}

#[tokio::test]
async fn timeline_shows_one_patient_newest_first() -> Result<()> {
    let c = Clinic::new();
    c.as_new("doc@example.com", Role::Doctor).await;
    for (id, patient, ts) in [("e1", "p1", 10), ("e2", "p2", 20), ("e3", "p1", 30)] {
        let fields = to_fields(&json!({"patientId": patient, "type": "Visit", "notes": "ok", "timestamp": ts}))?;
        c.mem.set("medical_history", id, fields).await?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _h = c.portal.watch_patient_timeline("p1", move |ev| {
        let _ = tx.send(ev);
    })?;
    let s = next_snapshot(&mut rx).await;
    assert_eq!(s.ids(), vec!["e3", "e1"]);
    assert!(s.iter().all(|e| e.record.patient_id == "p1"));
    Ok(())
}

#[tokio::test]
async fn dashboard_is_admin_only() -> Result<()> {
    let c = Clinic::new();
    c.account("admin@example.com", Role::Admin).await;
    c.account("doc@example.com", Role::Doctor).await;
    c.account("doc2@example.com", Role::Doctor).await;
    c.mem.set("patients", "p1", to_fields(&json!({"name": "Ali", "createdAt": 1}))?).await?;

    c.login("doc@example.com").await;
    assert!(c.portal.dashboard_stats().await.unwrap_err().is_permission_denied());
    assert_eq!(c.portal.list_doctors().await?.len(), 2);
    c.portal.sign_out().await?;

    c.login("admin@example.com").await;
    c.portal.book_appointment(draft("Ali"), Some("p1")).await?;
    let stats = c.portal.dashboard_stats().await?;
    assert_eq!((stats.patients, stats.doctors, stats.appointments), (1, 2, 1));
    Ok(())
}

#[tokio::test]
async fn registration_writes_directory_entry_and_resolves_role() -> Result<()> {
    let c = Clinic::new();
    let (_sub, mut rx) = c.portal.session().watch();
    let id = c.portal.register_account("Nora", "nora@example.com", "pw", Role::Patient).await?;

    let entry = c.mem.get("users", &id.id).await?;
    assert_eq!(entry.get("role"), Some(&json!("patient")));
    assert_eq!(entry.get("name"), Some(&json!("Nora")));

    loop {
        let s = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("session feed");
        if s.status == SessionStatus::Ready && s.role == Some(Role::Patient) {
            break;
        }
    }
    let dup = c.portal.register_account("Nora", "nora@example.com", "pw", Role::Patient).await.unwrap_err();
    assert!(matches!(dup, AppError::Conflict { .. }));
    Ok(())
}

#[tokio::test]
async fn bad_credentials_are_auth_errors() -> Result<()> {
    let c = Clinic::new();
    c.account("x@example.com", Role::Doctor).await;
    let err = c.portal.sign_in("x@example.com", "wrong").await.unwrap_err();
    assert!(matches!(err, AppError::Auth { .. }));
    assert!(c.provider.current().is_none());
    assert_eq!(c.portal.current_session().status, SessionStatus::Unauthenticated);
    Ok(())
}

#[tokio::test]
async fn self_registered_patient_can_open_own_profile() -> Result<()> {
    let c = Clinic::new();
    let (_sub, mut rx) = c.portal.session().watch();
    let id = c.portal.register_account("Omar", "omar@example.com", "pw", Role::Patient).await?;
    loop {
        let s = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("session feed");
        if s.status == SessionStatus::Ready && s.role == Some(Role::Patient) {
            break;
        }
    }

    let profile = c.portal.patient_profile(&id.id).await?;
    assert_eq!(profile.id, id.id);
    assert_eq!(profile.record.name, "Omar");

    // staff accounts get no patient record
    let doc = c.portal.register_account("Dr Lee", "lee@example.com", "pw", Role::Doctor).await?;
    assert!(c.mem.get("patients", &doc.id).await.unwrap_err().is_not_found());
    Ok(())
}
