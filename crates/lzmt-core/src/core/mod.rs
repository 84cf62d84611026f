pub mod executor;
pub mod work_stealing;

pub use executor::{ExecutorRuntimeSnapshot, Job, TaskExecutor, WorkerRuntimeSnapshot};
pub use work_stealing::{WorkStealingQueue, WorkStealingWorker};
