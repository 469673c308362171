pub mod atomic;
pub mod audit;
pub mod correlation;
pub mod session;

pub use audit::{AuditEvent, AuditLogger};
pub use correlation::CorrelationStore;
pub use session::{Session, SessionKey, SessionStatus, SessionStore};
