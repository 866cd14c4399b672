//! Background tasks spawned at startup.

mod automation_evaluator;
mod cleanup;
mod queue_processor;
mod snapshot_collector;

pub use automation_evaluator::spawn_automation_evaluator_task;
pub use cleanup::{run_cleanup, spawn_cleanup_task, CleanupStats};
pub use queue_processor::{backoff, spawn_queue_processor_task, QueueProcessor, QueueRunStats};
pub use snapshot_collector::spawn_snapshot_collector_task;
