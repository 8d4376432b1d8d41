//! Canonical, cross-crate types for the Carousel auction platform.
//!
//! This crate is **dependency-light** and **stable**: every service crate
//! depends on it for identifiers, the money alias and the shared error
//! type, so that values and errors cross module boundaries without
//! re-mapping.

pub mod error;
pub mod types;

pub use error::{CoreError, Result};
pub use types::{Amount, AuctionId, BetId, RoundId, TransactionId, UserId};
