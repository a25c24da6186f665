//! Engine runtime: the orchestrator loop and cooperative shutdown.

mod orchestrator;
mod shutdown;

pub use orchestrator::Orchestrator;
pub use shutdown::ShutdownToken;
