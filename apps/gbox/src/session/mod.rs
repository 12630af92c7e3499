pub mod exec;
pub mod terminal;

pub use exec::{ExecError, ExecSession, ExitStatus, TransportPlan, stdin_enabled};
