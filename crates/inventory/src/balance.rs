//! Balance projection rules: one summary row per (product, location).
//!
//! These functions are the only place a [`StockBalance`] is mutated. Storage
//! backends call them (or their SQL equivalent) inside the same unit of work
//! that appends the movement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockpile_core::Quantity;

use crate::error::{StockError, StockResult};
use crate::ids::{LocationId, ProductId};
use crate::movement::{BalanceKey, FloorPolicy};

/// Current on-hand and reserved quantity for a pair.
///
/// `available` is derived on read and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub on_hand: Quantity,
    pub reserved: Quantity,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Side effects of applying a delta, reported for logging.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct BalanceEffect {
    /// Reservation removed because an unchecked decrease took on-hand below it.
    pub reservation_truncated: Option<Quantity>,
}

/// Outcome of a reservation release.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub requested: Quantity,
    pub released: Quantity,
}

impl Release {
    pub fn is_clamped(&self) -> bool {
        self.released < self.requested
    }

    pub fn overage(&self) -> Quantity {
        self.requested - self.released
    }
}

impl StockBalance {
    /// Balance row as it exists before the first movement for the pair.
    pub fn empty(key: BalanceKey) -> Self {
        Self {
            product_id: key.product_id,
            location_id: key.location_id,
            on_hand: Quantity::ZERO,
            reserved: Quantity::ZERO,
            updated_at: None,
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.product_id, self.location_id)
    }

    pub fn available(&self) -> Quantity {
        self.on_hand - self.reserved
    }

    pub fn is_zero(&self) -> bool {
        self.on_hand.is_zero() && self.reserved.is_zero()
    }

    /// `on_hand += delta`.
    ///
    /// With [`FloorPolicy::Enforced`] a decrease may not take on-hand below the
    /// reserved quantity. An unchecked decrease always applies; if it leaves
    /// less on hand than is reserved, the reservation is truncated to
    /// `max(on_hand, 0)`.
    pub fn apply_delta(
        &mut self,
        delta: Quantity,
        floor: FloorPolicy,
        at: DateTime<Utc>,
    ) -> StockResult<BalanceEffect> {
        let next = self.on_hand.checked_add(delta)?;
        let mut effect = BalanceEffect::default();

        if delta.is_negative() {
            match floor {
                FloorPolicy::Enforced => {
                    if next < self.reserved {
                        return Err(StockError::InsufficientStock {
                            product_id: self.product_id,
                            location_id: self.location_id,
                            requested: delta.abs(),
                            available: self.available(),
                        });
                    }
                }
                FloorPolicy::Unchecked => {
                    let ceiling = next.max(Quantity::ZERO);
                    if self.reserved > ceiling {
                        effect.reservation_truncated = Some(self.reserved - ceiling);
                        self.reserved = ceiling;
                    }
                }
            }
        }

        self.on_hand = next;
        self.updated_at = Some(at);
        Ok(effect)
    }

    /// Compare-and-increment: `reserved += qty` only if `reserved + qty <= on_hand`.
    pub fn reserve(&mut self, qty: Quantity, at: DateTime<Utc>) -> StockResult<()> {
        ensure_positive(qty, "reservation")?;
        let next = self.reserved.checked_add(qty)?;
        if next > self.on_hand {
            return Err(StockError::InsufficientAvailable {
                product_id: self.product_id,
                location_id: self.location_id,
                requested: qty,
                available: self.available(),
            });
        }
        self.reserved = next;
        self.updated_at = Some(at);
        Ok(())
    }

    /// `reserved -= qty`, floored at zero.
    pub fn release(&mut self, qty: Quantity, at: DateTime<Utc>) -> StockResult<Release> {
        ensure_positive(qty, "release")?;
        let released = qty.min(self.reserved);
        self.reserved -= released;
        self.updated_at = Some(at);
        Ok(Release {
            requested: qty,
            released,
        })
    }

    /// Strict view of a clamped release, for callers that treat it as an error.
    pub fn over_release_error(&self, release: &Release) -> Option<StockError> {
        release.is_clamped().then(|| StockError::OverRelease {
            product_id: self.product_id,
            location_id: self.location_id,
            requested: release.requested,
            reserved: release.released,
        })
    }
}

fn ensure_positive(qty: Quantity, what: &str) -> StockResult<()> {
    if qty.is_positive() {
        Ok(())
    } else {
        Err(StockError::validation(format!(
            "{what} quantity must be positive, got {qty}"
        )))
    }
}
