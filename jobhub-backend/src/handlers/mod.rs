pub mod job_types;
pub mod jobs;

pub mod utils;
