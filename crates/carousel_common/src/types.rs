//! Primitive identifiers and the money alias shared by all Carousel crates.
//!
//! Money is always an integer count of the smallest currency or point unit;
//! no floating point ever touches the ledger path.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Money in the smallest currency/point unit.
pub type Amount = u64;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// A platform user. Resolution from external credentials happens
    /// upstream; the engine only ever sees this identifier.
    UserId
);
entity_id!(
    /// An auction: a sequence of numbered rounds sharing one prize policy.
    AuctionId
);
entity_id!(
    /// A single timed bidding window within an auction.
    RoundId
);
entity_id!(
    /// A user's single active stake in one round.
    BetId
);
entity_id!(
    /// An append-only ledger entry.
    TransactionId
);
