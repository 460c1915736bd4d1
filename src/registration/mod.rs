//! UAT registration engine.
//!
//! A request is dispatched to the processor workflow with a fresh correlation
//! token, the run carrying that token is located and followed to completion,
//! and tracking then moves to the approval workflow's run for the same token.

pub mod classifier;
pub mod dispatch;
pub mod inspector;
pub mod machine;
pub mod poller;
pub mod resolver;
pub mod service;
pub mod status;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{Classification, ErrorCategory, classify};
pub use dispatch::RegistrationRequest;
pub use poller::{Clock, PhasePoller, TickOutcome, TokioClock};
pub use service::Registrar;
pub use status::{RegistrationState, RegistrationStatus, Stage};
pub use token::CorrelationToken;
