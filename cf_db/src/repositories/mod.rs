//! ABOUTME: Repository modules for all persistent entities
//! ABOUTME: One repository per table, plain runtime queries

pub mod assignments;
pub mod cursors;
pub mod executions;
pub mod executors;
pub mod instances;
pub mod tasks;

pub use assignments::{AssignmentRepository, TaskAssignment};
pub use cursors::{CursorRepository, LbCursor};
pub use executions::{
    Execution, ExecutionFilter, ExecutionRepository, ExecutionStatus, StatusCounts,
};
pub use executors::{Executor, ExecutorPatch, ExecutorRepository, ExecutorStatus, RegisterExecutor};
pub use instances::{InstanceRepository, SchedulerInstance};
pub use tasks::{CreateTaskRequest, ExecutionMode, LbStrategy, Task, TaskRepository, TaskStatus, UpdateTaskRequest};
