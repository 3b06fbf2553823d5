//! Identity, session and access control for the portal.

mod principal;
mod provider;
mod cache;
mod session;
mod authorizer;
mod route_guard;

pub use principal::Identity;
pub use provider::{IdentityFeed, IdentityProvider, LocalIdentityProvider, SharedIdentityProvider};
pub use cache::{CachedSession, FileSessionCache, MemorySessionCache, SessionCache, SharedSessionCache};
pub use session::{Session, SessionListener, SessionManager, SessionStatus, SessionSubscription};
pub use authorizer::{Action, PermissionGate, Role};
pub use route_guard::{decide, GuardDecision, RedirectTarget, RouteGuard};
