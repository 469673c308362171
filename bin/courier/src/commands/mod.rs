pub mod audit_cmd;
pub mod probe;
pub mod run_cmd;
pub mod snapshot_cmd;
pub mod status;
