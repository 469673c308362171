pub mod adapter;
pub mod brain;
pub mod broker;
pub mod cerebellum;
pub mod detect;
pub mod health;
pub mod mailbox;
pub mod micro;
pub mod runtime;
pub mod snapshot;
pub mod supervisor;
pub mod threading;

pub use brain::Brain;
pub use broker::PostOffice;
pub use cerebellum::{Cerebellum, Verdict};
pub use detect::ActionDetector;
pub use health::{BackendMonitor, BackendStatus, HealthGate};
pub use mailbox::Mailbox;
pub use micro::{MicroAgent, MicroBudget, MicroOutcome};
pub use runtime::{AgentRuntime, Outcome, RuntimeSettings, SharedServices};
pub use snapshot::{AgentSnapshot, Snapshot};
pub use supervisor::Supervisor;
