//! Task-count driven dispatch of email workers.

pub mod launcher;
pub mod scheduler;
