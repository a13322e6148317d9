//! Core domain models for crewline.
//!
//! Tasks, their typed dependency edges, and the registry graph the
//! scheduler dispatches from.

pub mod dag;
pub mod task;

pub use dag::TaskDAG;
pub use task::{Dependency, DependencyType, Task, TaskId, TaskPriority, TaskStatus};
