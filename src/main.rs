use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use clinic_portal::identity::{LocalIdentityProvider, Role, RouteGuard, SessionStatus};
use clinic_portal::realtime::CollectionEvent;
use clinic_portal::records::{now_ms, AppointmentDraft, UserProfile};
use clinic_portal::storage::{to_fields, DocumentStore, MemoryDocumentStore};
use clinic_portal::{ClinicPortal, PortalConfig};

const ADMIN_EMAIL: &str = "admin@clinic.local";
const ADMIN_SECRET: &str = "change-me";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PortalConfig::from_env();

    // RUST_LOG wins over the configured default
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    info!(
        target: "clinic",
        "clinic portal starting: cache={}, collections={:?}",
        config.cache_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<memory>".to_string()),
        config.collections
    );

    let provider = Arc::new(LocalIdentityProvider::new());
    let store = Arc::new(MemoryDocumentStore::new());

    let admin = provider.seed_account(ADMIN_EMAIL, ADMIN_SECRET).context("seeding admin account")?;
    let profile = UserProfile {
        uid: admin.id.clone(),
        name: "Administrator".to_string(),
        email: admin.email.clone(),
        role: Role::Admin.as_str().to_string(),
        created_at: now_ms(),
    };
    store.set(&config.collections.users, &admin.id, to_fields(&profile)?).await?;

    let portal = ClinicPortal::from_config(&config, provider, store);
    let guard = RouteGuard::for_role(Role::Admin);
    let (_session_sub, mut sessions) = portal.session().watch();
    portal.start();

    portal.sign_in(ADMIN_EMAIL, ADMIN_SECRET).await?;
    loop {
        let session = tokio::time::timeout(Duration::from_secs(5), sessions.recv())
            .await
            .context("timed out waiting for role resolution")?
            .context("session feed closed")?;
        info!(target: "clinic", "guard decision for dashboard: {:?}", guard.check(&session));
        match session.status {
            SessionStatus::Ready if !session.provisional && session.identity.is_some() => break,
            SessionStatus::Error => anyhow::bail!("role lookup failed: {:?}", portal.session().last_error()),
            _ => {}
        }
    }

    let (tx, mut appointments) = tokio::sync::mpsc::unbounded_channel();
    let handle = portal.watch_appointments(move |ev| {
        let _ = tx.send(ev);
    })?;

    let id = portal
        .book_appointment(
            AppointmentDraft {
                patient_name: "Walk-in patient".to_string(),
                doctor_id: admin.id.clone(),
                doctor_name: "Administrator".to_string(),
                date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
                time: "09:30".to_string(),
                reason: "demo booking".to_string(),
                status: None,
            },
            None,
        )
        .await?;
    info!(target: "clinic", "booked appointment {}", id);

    // initial snapshot, then the one carrying the booking
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(5), appointments.recv()).await {
            Ok(Some(CollectionEvent::Snapshot(s))) => info!(target: "clinic", "appointments: {} live", s.len()),
            Ok(Some(CollectionEvent::Failed(e))) => warn!(target: "clinic", "appointment feed failed: {}", e),
            _ => break,
        }
    }

    let stats = portal.dashboard_stats().await?;
    info!(target: "clinic", "dashboard: {:?}", stats);

    handle.dispose();
    portal.sign_out().await?;
    info!(target: "clinic", "signed out; session={:?}", portal.current_session().status);
    Ok(())
}
