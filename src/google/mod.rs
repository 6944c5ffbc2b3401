//! REST adapters for the mailbox, calendar and document storage services.
//!
//! Each adapter sits behind a trait so the pipeline can run against
//! in-memory doubles.

pub mod calendar;
pub mod drive;
pub mod gmail;
pub mod http;
