mod pool;

pub use pool::{ExecutionOutcome, Executor, WorkerPoolManager};
