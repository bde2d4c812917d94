pub mod orchestrator;
pub mod provenance;
pub mod queue;
pub mod sizing;

pub use orchestrator::JobOrchestrator;
