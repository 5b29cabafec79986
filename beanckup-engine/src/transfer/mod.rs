//! Progress reporting for long-running scan, hash and copy work.

pub mod progress;
pub mod progress_stream;
