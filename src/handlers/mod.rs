// HTTP handlers
//
// Routes exposing the job lifecycle (status, start, resume, restart, segments),
// batches and metrics.

pub mod routes;

pub use self::routes::{
    batch_status, create_batch, job_segments, job_status, metrics_endpoint, restart_job,
    resume_job, start_job,
};
