//! Domain records stored in the portal's collections.
//!
//! Field names follow the stored document shape (camelCase). Timestamps are epoch
//! milliseconds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub disease: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub created_at: i64,
}

/// Editable fields of a patient record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientDraft {
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub disease: String,
    #[serde(default)]
    pub contact: String,
}

impl PatientDraft {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::user("name_required", "patient name is required"));
        }
        Ok(())
    }

    pub fn into_patient(self, created_at: i64) -> Patient {
        Patient {
            name: self.name.trim().to_string(),
            age: self.age,
            gender: self.gender,
            disease: self.disease,
            contact: self.contact,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[default]
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for AppointmentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            other => Err(AppError::user("unknown_status".to_string(), format!("unknown appointment status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub patient_name: String,
    pub doctor_id: String,
    #[serde(default)]
    pub doctor_name: String,
    pub date: String,
    pub time: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub status: AppointmentStatus,
    #[serde(default)]
    pub booked_by: String,
    #[serde(default)]
    pub created_at: i64,
}

/// Booking form. `status` is normally omitted and defaults to pending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentDraft {
    pub patient_name: String,
    pub doctor_id: String,
    #[serde(default)]
    pub doctor_name: String,
    pub date: String,
    pub time: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub status: Option<AppointmentStatus>,
}

impl AppointmentDraft {
    pub fn validate(&self) -> AppResult<()> {
        let missing: Vec<&str> = [
            ("patientName", &self.patient_name),
            ("doctorId", &self.doctor_id),
            ("date", &self.date),
            ("time", &self.time),
        ]
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| *k)
        .collect();
        if !missing.is_empty() {
            return Err(AppError::user("missing_fields".to_string(), format!("required fields missing: {}", missing.join(", "))));
        }
        Ok(())
    }

    pub fn into_appointment(self, booked_by: &str, created_at: i64) -> Appointment {
        Appointment {
            patient_name: self.patient_name,
            doctor_id: self.doctor_id,
            doctor_name: self.doctor_name,
            date: self.date,
            time: self.time,
            reason: self.reason,
            status: self.status.unwrap_or_default(),
            booked_by: booked_by.to_string(),
            created_at,
        }
    }
}

/// Entry on a patient's medical history timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalEvent {
    pub patient_id: String,
    /// e.g. "Prescription" or "Visit".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, alias = "medicines", skip_serializing_if = "Option::is_none")]
    pub medicine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Directory entry under `users/{identity id}`; the source of a session's role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub created_at: i64,
}

/// Counts shown on the admin landing area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub patients: usize,
    pub doctors: usize,
    pub appointments: usize,
}

pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }
