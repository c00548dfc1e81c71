//! `stockpile-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the fixed-precision [`Quantity`], the error model, the clock
//! collaborator and the pre-resolved caller identity ([`Actor`]).

pub mod actor;
pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;
pub mod quantity;

pub use actor::{Actor, Capability, CapabilitySet, Resource};
pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, UserId};
pub use quantity::{QUANTITY_INTEGER_DIGITS, QUANTITY_SCALE, Quantity};
