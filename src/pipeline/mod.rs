//! Notification pipeline.
//!
//! Every push notification flows through:
//! 1. `notification` — decode the transport payload
//! 2. `history` — list messages added since the stored checkpoint
//! 3. `ledger` — claim each message id exactly once
//! 4. `rules` — classify sender, subject and body into an `Effect`
//! 5. `reconcile` / `artifact` + `archive` — apply the effect
//!
//! `handler` drives the steps and owns checkpoint advancement.

pub mod archive;
pub mod artifact;
pub mod handler;
pub mod history;
pub mod ledger;
pub mod message;
pub mod notification;
pub mod reconcile;
pub mod rules;
pub mod statement;
pub mod types;
pub mod watch;
