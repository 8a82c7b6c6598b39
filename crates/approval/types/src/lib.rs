//! Approval Domain Types
//!
//! This crate defines the domain types for threshold approval workflows:
//! requests that need N approvals out of a designated approver set before an
//! irreversible side effect is executed exactly once.
//!
//! # Key Concepts
//!
//! - **Approval Request**: a pending action (ledger transaction or redemption
//!   settlement) together with its threshold and its designated approvers.
//! - **Confirmation**: one approver's decision on one request. Later decisions
//!   supersede earlier ones; superseded confirmations are kept for audit.
//! - **Status Transition**: the event emitted every time a request changes
//!   status.
//!
//! # Architecture
//!
//! This is a pure types crate with no runtime dependencies. All types
//! implement `Clone`, `Debug`, `Serialize`, `Deserialize`. IDs use the
//! newtype pattern and implement `Display`, `generate()`, and `new()`.

#![deny(unsafe_code)]

mod confirmation;
mod errors;
mod event;
mod ids;
mod request;

pub use confirmation::*;
pub use errors::*;
pub use event::*;
pub use ids::*;
pub use request::*;
