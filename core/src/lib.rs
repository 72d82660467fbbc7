//! Assessment engine: the encrypted audit log, network mapping, the attack
//! orchestrator and report generation.

pub mod audit;
pub mod mapper;
pub mod orchestrator;
pub mod report;
pub mod scanner;
pub mod vendors;

pub use audit::{AuditKey, AuditLog};
pub use mapper::{MapperBuilder, MapperSettings, NetworkMapper};
pub use orchestrator::{AttackOrchestrator, OrchestratorSettings, RunPlan, RunSummary};
pub use report::{Report, ReportBuilder, ReportFormat};
