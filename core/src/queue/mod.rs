pub mod job_codec;
pub mod job_queue;
pub mod queue_manager;
pub mod sqlite_job_queue;
