//! FIFO stock aging derived from the movement history of one pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockpile_core::Quantity;

use crate::error::{StockError, StockResult};
use crate::movement::{Direction, StockMovement};

/// Upper bounds (in days) of the default aging buckets: 0-30, 31-60, 61-90, 90+.
pub const DEFAULT_AGING_BOUNDARIES: [u32; 3] = [30, 60, 90];

/// Quantity still on hand from one inbound movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoLayer {
    pub received_at: DateTime<Utc>,
    pub quantity: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingBucket {
    pub label: String,
    pub min_days: u32,
    /// `None` for the open-ended last bucket.
    pub max_days: Option<u32>,
    pub quantity: Quantity,
}

/// Replay a pair's history in ledger order; decreases consume the oldest layers.
///
/// A decrease that finds no layers left (possible after an unchecked
/// adjustment) is carried as a deficit that later increases pay off first.
pub fn fifo_layers<'a>(movements: impl IntoIterator<Item = &'a StockMovement>) -> Vec<FifoLayer> {
    let mut ordered: Vec<&StockMovement> = movements.into_iter().collect();
    ordered.sort_by(|a, b| {
        a.effective_at
            .cmp(&b.effective_at)
            .then(a.sequence.cmp(&b.sequence))
    });

    let mut layers: Vec<FifoLayer> = Vec::new();
    let mut head = 0usize;
    let mut deficit = Quantity::ZERO;

    for m in ordered {
        match m.direction {
            Direction::Increase => {
                let mut qty = m.quantity;
                if deficit.is_positive() {
                    let paid = qty.min(deficit);
                    deficit -= paid;
                    qty -= paid;
                }
                if qty.is_positive() {
                    layers.push(FifoLayer {
                        received_at: m.effective_at,
                        quantity: qty,
                    });
                }
            }
            Direction::Decrease => {
                let mut remaining = m.quantity;
                while remaining.is_positive() && head < layers.len() {
                    let layer = &mut layers[head];
                    let taken = remaining.min(layer.quantity);
                    layer.quantity -= taken;
                    remaining -= taken;
                    if layer.quantity.is_zero() {
                        head += 1;
                    }
                }
                deficit += remaining;
            }
        }
    }

    layers.split_off(head)
}

/// Bucket FIFO layers by age in whole days at `as_of`.
///
/// `boundaries` must be strictly increasing; `[30, 60]` yields
/// `0-30`, `31-60` and `60+`.
pub fn age_buckets(
    layers: &[FifoLayer],
    as_of: DateTime<Utc>,
    boundaries: &[u32],
) -> StockResult<Vec<AgingBucket>> {
    if boundaries.is_empty() {
        return Err(StockError::validation("aging needs at least one boundary"));
    }
    if boundaries.windows(2).any(|w| w[0] >= w[1]) {
        return Err(StockError::validation(
            "aging boundaries must be strictly increasing",
        ));
    }
    let last = boundaries[boundaries.len() - 1];
    let open_from = last
        .checked_add(1)
        .ok_or_else(|| StockError::validation(format!("aging boundary {last} is too large")))?;

    let mut buckets = Vec::with_capacity(boundaries.len() + 1);
    let mut lower = 0u32;
    for &upper in boundaries {
        buckets.push(AgingBucket {
            label: format!("{lower}-{upper}"),
            min_days: lower,
            max_days: Some(upper),
            quantity: Quantity::ZERO,
        });
        // Strictly increasing and capped by `last`, so this cannot overflow.
        lower = upper + 1;
    }
    buckets.push(AgingBucket {
        label: format!("{last}+"),
        min_days: open_from,
        max_days: None,
        quantity: Quantity::ZERO,
    });

    for layer in layers {
        let days = (as_of - layer.received_at).num_days().max(0);
        let idx = boundaries
            .iter()
            .position(|&upper| days <= i64::from(upper))
            .unwrap_or(boundaries.len());
        buckets[idx].quantity += layer.quantity;
    }

    Ok(buckets)
}
