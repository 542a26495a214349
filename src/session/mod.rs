//! Prediction-Session Orchestration
//! Mission: Admission, dispatch, progress tracking, and crash recovery

pub mod admission;
pub mod dispatcher;
pub mod progress;
pub mod recovery;
pub mod store;

pub use admission::{AdmissionController, AdmissionError};
pub use dispatcher::{DispatchJob, DispatchQueue, DispatchReceiver, Dispatcher};
pub use progress::TransitionOutcome;
pub use recovery::{RecoveryMonitor, RecoveryOutcome};
pub use store::SessionStore;
