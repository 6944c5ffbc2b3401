//! Bill reconciler — turns mailbox push notifications into calendar and
//! archive updates.

pub mod config;
pub mod context;
pub mod error;
pub mod google;
pub mod pipeline;
pub mod server;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
