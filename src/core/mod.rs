//! 核心编排层：错误与恢复、会话监管、任务调度、事件、编排器与回合循环

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;
pub mod turn_loop;

pub use builder::OrchestratorBuilder;
pub use error::{OrchestratorError, RecoveryAction};
pub use events::{EventEmitter, EventEnvelope, EventReceiver, OrchestratorEvent, RunPhase};
pub use orchestrator::{Orchestrator, StatementOptions, StatementResult};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use task_scheduler::TaskScheduler;
pub use turn_loop::extract_thinking;
