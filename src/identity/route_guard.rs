use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::authorizer::Role;
use super::session::{Session, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectTarget {
    Login,
    /// Default landing area (the dashboard).
    Landing,
}

impl RedirectTarget {
    pub fn path(&self) -> &'static str {
        match self {
            RedirectTarget::Login => "/login",
            RedirectTarget::Landing => "/dashboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "target", rename_all = "snake_case")]
pub enum GuardDecision {
    /// Render the protected content.
    Render,
    /// Render a neutral waiting state; no navigation.
    Wait,
    /// Role resolution failed; render an error with retry / re-login options.
    Failed,
    Redirect(RedirectTarget),
}

/// Pure access decision for a protected view.
pub fn decide(session: &Session, required: Option<Role>) -> GuardDecision {
    match session.status {
        SessionStatus::Unauthenticated => GuardDecision::Redirect(RedirectTarget::Login),
        SessionStatus::Resolving => GuardDecision::Wait,
        SessionStatus::Error => GuardDecision::Failed,
        SessionStatus::Ready => match required {
            Some(role) if session.role != Some(role) => GuardDecision::Redirect(RedirectTarget::Landing),
            _ => GuardDecision::Render,
        },
    }
}

/// Per-view guard. Issues a redirect at most once per published session revision; repeated
/// renders of the same state get `Wait` while the navigation is under way.
#[derive(Debug, Default)]
pub struct RouteGuard {
    required: Option<Role>,
    last_redirect: Mutex<Option<u64>>,
}

impl RouteGuard {
    pub fn new(required: Option<Role>) -> Self { Self { required, last_redirect: Mutex::new(None) } }

    pub fn for_role(role: Role) -> Self { Self::new(Some(role)) }

    pub fn required(&self) -> Option<Role> { self.required }

    pub fn check(&self, session: &Session) -> GuardDecision {
        match decide(session, self.required) {
            GuardDecision::Redirect(target) => {
                let mut last = self.last_redirect.lock();
                if *last == Some(session.revision) {
                    return GuardDecision::Wait;
                }
                *last = Some(session.revision);
                debug!(target: "clinic::guard", "redirect to {} at revision {}", target.path(), session.revision);
                GuardDecision::Redirect(target)
            }
            other => other,
        }
    }
}
