//! Flood notification delivery: severity styling, the email sender, the
//! retry policy and the `email` queue worker.

pub mod retry;
pub mod sender;
pub mod severity;
pub mod worker;
