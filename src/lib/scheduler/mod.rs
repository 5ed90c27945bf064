pub mod scheduler;
pub mod trigger;
pub mod types;

pub use scheduler::Scheduler;
pub use types::{ActionResult, TaskAction, TaskInfo};
