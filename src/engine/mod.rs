pub mod aggregate;
pub mod graph;
pub mod join;
pub mod run;
pub mod stage;
pub mod task;

pub use graph::{Graph, GraphBuilder, GraphReport, RunContext};
pub use run::{execute, RunSummary};
pub use task::{StageTask, TaskContext, WorkArea};
