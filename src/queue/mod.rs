//! 优先级任务队列

pub mod job;
pub mod priority_queue;
pub mod transcription;

pub use job::{Job, JobId, JobInfo, JobStatus, Priority};
pub use priority_queue::{PriorityJobQueue, QueueConfig, QueueStats};
pub use transcription::TranscriptionQueue;
