use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::session::Session;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Receptionist,
    Patient,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Doctor, Role::Receptionist, Role::Patient];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Receptionist => "receptionist",
            Role::Patient => "patient",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "doctor" => Ok(Role::Doctor),
            "receptionist" => Ok(Role::Receptionist),
            "patient" => Ok(Role::Patient),
            other => Err(AppError::user("unknown_role".to_string(), format!("unknown role '{}'", other))),
        }
    }
}

/// Mutating or protected actions known to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateAppointment,
    ChangeAppointmentStatus,
    DeleteAppointment,
    CreatePatient,
    UpdatePatient,
    DeletePatient,
    ViewOwnRecord,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::CreateAppointment,
        Action::ChangeAppointmentStatus,
        Action::DeleteAppointment,
        Action::CreatePatient,
        Action::UpdatePatient,
        Action::DeletePatient,
        Action::ViewOwnRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateAppointment => "create_appointment",
            Action::ChangeAppointmentStatus => "change_appointment_status",
            Action::DeleteAppointment => "delete_appointment",
            Action::CreatePatient => "create_patient",
            Action::UpdatePatient => "update_patient",
            Action::DeletePatient => "delete_patient",
            Action::ViewOwnRecord => "view_own_record",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Action {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == norm)
            .ok_or_else(|| AppError::user("unknown_action".to_string(), format!("unknown action '{}'", s)))
    }
}

/// Outcome of the table lookup for one (role, action) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Deny,
    Allow,
    /// Allowed only when the resource owner is the acting identity.
    SelfOnly,
}

fn grant_for(role: Role, action: Action) -> Grant {
    use Action::*;
    match (role, action) {
        (Role::Admin, _) => Grant::Allow,

        (Role::Receptionist, CreateAppointment | DeleteAppointment) => Grant::Allow,
        (Role::Receptionist, CreatePatient | UpdatePatient | DeletePatient) => Grant::Allow,
        (Role::Receptionist, ViewOwnRecord) => Grant::Allow,

        (Role::Doctor, ChangeAppointmentStatus) => Grant::Allow,
        (Role::Doctor, ViewOwnRecord) => Grant::Allow,

        (Role::Patient, CreateAppointment | ViewOwnRecord) => Grant::SelfOnly,

        _ => Grant::Deny,
    }
}

/// Stateless role/action table. Performs no I/O; anything it does not recognise is denied.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionGate;

impl PermissionGate {
    /// Whether `role` may perform `action`. `actor_id` is the acting identity's id and
    /// `resource_owner_id` the owner of the target resource, both required for self-only cells.
    pub fn allows(role: Role, action: Action, actor_id: &str, resource_owner_id: Option<&str>) -> bool {
        match grant_for(role, action) {
            Grant::Allow => true,
            Grant::Deny => false,
            Grant::SelfOnly => match resource_owner_id {
                Some(owner) => !actor_id.is_empty() && owner == actor_id,
                None => false,
            },
        }
    }

    /// String-typed entry point for untrusted input. Unknown roles or actions are denied.
    pub fn allows_named(role: &str, action: &str, actor_id: &str, resource_owner_id: Option<&str>) -> bool {
        match (role.parse::<Role>(), action.parse::<Action>()) {
            (Ok(r), Ok(a)) => Self::allows(r, a, actor_id, resource_owner_id),
            _ => false,
        }
    }

    /// Gate a session. Only verified sessions pass: a cache-derived provisional session, a
    /// missing identity or an unresolved role are all denied.
    pub fn allows_session(session: &Session, action: Action, resource_owner_id: Option<&str>) -> bool {
        match (session.identity.as_ref(), session.role) {
            (Some(who), Some(role)) if session.is_verified() => Self::allows(role, action, &who.id, resource_owner_id),
            _ => false,
        }
    }

    /// `allows_session` as a `Result`, for short-circuiting mutation entry points.
    pub fn check(session: &Session, action: Action, resource_owner_id: Option<&str>) -> AppResult<()> {
        if Self::allows_session(session, action, resource_owner_id) {
            return Ok(());
        }
        let who = session.role.map(|r| r.as_str()).unwrap_or("unresolved role");
        Err(AppError::denied("permission_denied".to_string(), format!("{} may not {}", who, action.as_str().replace('_', " "))))
    }
}

#[cfg(test)]
#[path = "authorizer_tests.rs"]
mod authorizer_tests;
