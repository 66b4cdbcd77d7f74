// core of the scheduler: task model, dispatch queue, dependency gating, cron schedules,
// retries, and the checkpoint/recovery layer the loop drives
pub mod config;
pub mod cron;
mod dependency;
pub mod error;
mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use registry::{FunctionError, FunctionResult, TaskFunction};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerHealth, SchedulerStats};
pub use task::{Schedule, Task, TaskPriority, TaskSpec, TaskStatus, TaskType};
