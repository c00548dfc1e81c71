//! Filters, pagination and page shapes shared by every backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockpile_core::Quantity;
use stockpile_inventory::{
    Direction, LocationId, MovementKind, MovementReference, ProductId, StockBalance, StockMovement,
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    /// 0-based.
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0),
        }
    }

    /// Slice an already-ordered result set.
    pub fn apply<T>(self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let items: Vec<T> = items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect();
        Page::new(items, total, self)
    }
}

/// Configured page-size bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PAGE_SIZE,
            max_limit: MAX_PAGE_SIZE,
        }
    }
}

impl PageLimits {
    /// A zero limit means "use the default"; anything above the cap is cut.
    pub fn clamp(&self, page: Pagination) -> Pagination {
        let limit = if page.limit == 0 {
            self.default_limit
        } else {
            page.limit
        };
        Pagination {
            limit: limit.min(self.max_limit),
            offset: page.offset,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total matching rows across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);
        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }
}

/// Filter for movement listings. Date bounds are inclusive and apply to
/// `effective_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub product_id: Option<ProductId>,
    pub location_id: Option<LocationId>,
    pub kind: Option<MovementKind>,
    pub reference: Option<MovementReference>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl MovementFilter {
    pub fn for_pair(product_id: ProductId, location_id: LocationId) -> Self {
        Self {
            product_id: Some(product_id),
            location_id: Some(location_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, m: &StockMovement) -> bool {
        self.product_id.is_none_or(|p| p == m.product_id)
            && self.location_id.is_none_or(|l| l == m.location_id)
            && self.kind.is_none_or(|k| k == m.kind)
            && self.reference.is_none_or(|r| Some(r) == m.reference)
            && self.date_from.is_none_or(|from| m.effective_at >= from)
            && self.date_to.is_none_or(|to| m.effective_at <= to)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFilter {
    pub product_id: Option<ProductId>,
    pub location_id: Option<LocationId>,
    /// Skip rows where both on-hand and reserved are zero.
    pub non_zero_only: bool,
}

impl BalanceFilter {
    pub fn matches(&self, b: &StockBalance) -> bool {
        self.product_id.is_none_or(|p| p == b.product_id)
            && self.location_id.is_none_or(|l| l == b.location_id)
            && !(self.non_zero_only && b.is_zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentState {
    Draft,
    Confirmed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentFilter {
    pub location_id: Option<LocationId>,
    pub status: Option<AdjustmentState>,
}

/// Totals over a filtered set of movements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementSummary {
    pub movement_count: u64,
    pub total_increase: Quantity,
    pub total_decrease: Quantity,
    /// Signed totals per kind.
    pub by_kind: BTreeMap<String, Quantity>,
}

impl MovementSummary {
    pub fn net(&self) -> Quantity {
        self.total_increase - self.total_decrease
    }

    pub fn record(&mut self, kind: MovementKind, direction: Direction, quantity: Quantity) {
        self.add(kind, direction, 1, quantity);
    }

    /// Fold a pre-aggregated (kind, direction) group.
    pub fn add(&mut self, kind: MovementKind, direction: Direction, count: u64, quantity: Quantity) {
        self.movement_count += count;
        let signed = match direction {
            Direction::Increase => {
                self.total_increase += quantity;
                quantity
            }
            Direction::Decrease => {
                self.total_decrease += quantity;
                -quantity
            }
        };
        *self
            .by_kind
            .entry(kind.as_str().to_string())
            .or_insert(Quantity::ZERO) += signed;
    }
}
