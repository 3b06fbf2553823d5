pub mod error;
pub mod config;
pub mod storage;
pub mod identity;
pub mod records;
pub mod realtime;
pub mod portal;

pub use config::PortalConfig;
pub use error::{AppError, AppResult, IdentityError};
pub use portal::ClinicPortal;
