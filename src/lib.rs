pub mod config;
pub mod errors;
pub mod github;
pub mod logging;
pub mod registration;
pub mod store;

pub use config::RegistrarConfig;
pub use errors::{ApiError, RegistrationError, StoreError};
pub use registration::{Registrar, RegistrationRequest, RegistrationState, RegistrationStatus};
