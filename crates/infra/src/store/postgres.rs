//! Postgres-backed ledger store.
//!
//! Each [`UnitOfWork`] runs in one transaction. Counters are changed with
//! single conditional statements so that the check and the write cannot be
//! separated by a concurrent writer:
//!
//! | Effect        | Statement                                                            |
//! |---------------|----------------------------------------------------------------------|
//! | movement      | `INSERT .. ON CONFLICT (movement_key) DO NOTHING RETURNING sequence` |
//! | on-hand       | `UPDATE .. SET on_hand = on_hand + $d WHERE on_hand + $d >= reserved` |
//! | reserve       | `UPDATE .. SET reserved = reserved + $q WHERE reserved + $q <= on_hand` |
//! | release       | `UPDATE .. SET reserved = GREATEST(reserved - $q, 0)`                |
//! | fulfillment   | `UPDATE .. SET fulfilled = fulfilled + $q WHERE fulfilled + $q <= ordered` |
//! | confirmation  | `SELECT .. FOR UPDATE` on the header, version check, then `UPDATE`   |
//!
//! ## Error Mapping
//!
//! | SQLx error                        | Code    | `LedgerError` |
//! |-----------------------------------|---------|---------------|
//! | unique violation                  | `23505` | `Conflict`    |
//! | check constraint violation        | `23514` | `Validation`  |
//! | serialization failure / deadlock  | `40001` / `40P01` | `Conflict` |
//! | anything else                     |         | `Storage`     |

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use stockpile_core::{AggregateRoot, ExpectedVersion, Quantity, UserId};
use stockpile_inventory::{
    AdjustmentId, AdjustmentLineId, AdjustmentStatus, BalanceKey, Confirmation, Direction,
    FloorPolicy, MovementDraft, MovementId, MovementKind, MovementReference, OrderKind, OrderLine,
    OrderLineId, ProductId, ReferenceType, Release, StockAdjustment, StockAdjustmentLine,
    StockBalance, StockError, StockMovement,
};

use super::query::{
    AdjustmentFilter, AdjustmentState, BalanceFilter, MovementFilter, MovementSummary, Page,
    Pagination,
};
use super::{CommitReceipt, LedgerStore, UnitOfWork};
use crate::error::{LedgerError, LedgerResult};

const MOVEMENT_COLUMNS: &str = "id, sequence, movement_key, product_id, location_id, kind, \
     direction, quantity, reference_type, reference_id, effective_at, recorded_at, note, \
     floor_policy, posted_by";

const BALANCE_COLUMNS: &str = "product_id, location_id, on_hand, reserved, updated_at";

const ORDER_LINE_COLUMNS: &str =
    "id, kind, document_id, line_no, product_id, location_id, ordered, fulfilled, updated_at";

const ADJUSTMENT_COLUMNS: &str = "id, location_id, adjustment_date, reason, status, \
     confirmed_by, confirmed_at, created_by, created_at, version";

const MOVEMENT_FILTER: &str = r#"
    ($1::uuid IS NULL OR product_id = $1)
    AND ($2::uuid IS NULL OR location_id = $2)
    AND ($3::text IS NULL OR kind = $3)
    AND ($4::text IS NULL OR reference_type = $4)
    AND ($5::uuid IS NULL OR reference_id = $5)
    AND ($6::timestamptz IS NULL OR effective_at >= $6)
    AND ($7::timestamptz IS NULL OR effective_at <= $7)
"#;

/// Reservation release, floored at zero; returns the reserved quantity before.
const RELEASE_SQL: &str = r#"
    WITH prev AS (
        SELECT product_id, location_id, reserved
        FROM stock_balances
        WHERE product_id = $1 AND location_id = $2
        FOR UPDATE
    )
    UPDATE stock_balances b
    SET reserved = GREATEST(b.reserved - $3, 0), updated_at = $4
    FROM prev
    WHERE b.product_id = prev.product_id AND b.location_id = prev.location_id
    RETURNING b.product_id, b.location_id, b.on_hand, b.reserved, b.updated_at,
              prev.reserved AS previous_reserved
"#;

/// Postgres-backed [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| LedgerError::storage(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(
        skip(self, work),
        fields(movements = work.movements.len(), releases = work.releases.len()),
        err
    )]
    async fn commit(&self, work: UnitOfWork) -> LedgerResult<CommitReceipt> {
        work.validate()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        match apply_unit(&mut tx, work).await {
            Ok(receipt) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(receipt)
            }
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                Err(err)
            }
        }
    }

    async fn reserve(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<StockBalance> {
        if !quantity.is_positive() {
            return Err(LedgerError::validation(format!(
                "reservation quantity must be positive, got {quantity}"
            )));
        }
        let row = sqlx::query(&format!(
            r#"
            UPDATE stock_balances
            SET reserved = reserved + $3, updated_at = $4
            WHERE product_id = $1 AND location_id = $2 AND reserved + $3 <= on_hand
            RETURNING {BALANCE_COLUMNS}
            "#
        ))
        .bind(key.product_id.as_uuid())
        .bind(key.location_id.as_uuid())
        .bind(quantity.as_decimal())
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reserve", e))?;

        match row {
            Some(row) => balance_from_row(&row),
            None => {
                let current = self
                    .balance(key)
                    .await?
                    .unwrap_or_else(|| StockBalance::empty(key));
                Err(StockError::InsufficientAvailable {
                    product_id: key.product_id,
                    location_id: key.location_id,
                    requested: quantity,
                    available: current.available(),
                }
                .into())
            }
        }
    }

    async fn release(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<(StockBalance, Release)> {
        if !quantity.is_positive() {
            return Err(LedgerError::validation(format!(
                "release quantity must be positive, got {quantity}"
            )));
        }
        let row = sqlx::query(RELEASE_SQL)
            .bind(key.product_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .bind(quantity.as_decimal())
            .bind(at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;

        match row {
            Some(row) => {
                let previous = to_quantity(get(&row, "previous_reserved")?)?;
                let release = Release {
                    requested: quantity,
                    released: quantity.min(previous),
                };
                Ok((balance_from_row(&row)?, release))
            }
            None => Ok((
                StockBalance::empty(key),
                Release {
                    requested: quantity,
                    released: Quantity::ZERO,
                },
            )),
        }
    }

    async fn balance(&self, key: BalanceKey) -> LedgerResult<Option<StockBalance>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        load_balance(&mut conn, key).await
    }

    async fn balances(&self, filter: &BalanceFilter) -> LedgerResult<Vec<StockBalance>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BALANCE_COLUMNS}
            FROM stock_balances
            WHERE ($1::uuid IS NULL OR product_id = $1)
                AND ($2::uuid IS NULL OR location_id = $2)
                AND (NOT $3 OR on_hand <> 0 OR reserved <> 0)
            "#
        ))
        .bind(filter.product_id.map(|p| *p.as_uuid()))
        .bind(filter.location_id.map(|l| *l.as_uuid()))
        .bind(filter.non_zero_only)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balances", e))?;

        rows.iter().map(balance_from_row).collect()
    }

    async fn movements(
        &self,
        filter: &MovementFilter,
        page: Pagination,
    ) -> LedgerResult<Page<StockMovement>> {
        let count_sql = format!("SELECT COUNT(*) AS total FROM stock_movements WHERE {MOVEMENT_FILTER}");
        let count_row = bind_movement_filter(sqlx::query(&count_sql), filter)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_movements", e))?;
        let total: i64 = get(&count_row, "total")?;

        let sql = format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM stock_movements
            WHERE {MOVEMENT_FILTER}
            ORDER BY effective_at DESC, sequence DESC
            LIMIT $8 OFFSET $9
            "#
        );
        let rows = bind_movement_filter(sqlx::query(&sql), filter)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_movements", e))?;

        let items = rows
            .iter()
            .map(movement_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
        debug!(total, returned = items.len(), "listed movements");
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    async fn summarize(&self, filter: &MovementFilter) -> LedgerResult<MovementSummary> {
        let sql = format!(
            r#"
            SELECT kind, direction, COUNT(*) AS movement_count, COALESCE(SUM(quantity), 0) AS total
            FROM stock_movements
            WHERE {MOVEMENT_FILTER}
            GROUP BY kind, direction
            "#
        );
        let rows = bind_movement_filter(sqlx::query(&sql), filter)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("summarize_movements", e))?;

        let mut summary = MovementSummary::default();
        for row in &rows {
            let kind: String = get(row, "kind")?;
            let direction: String = get(row, "direction")?;
            let count: i64 = get(row, "movement_count")?;
            summary.add(
                MovementKind::parse(&kind)?,
                Direction::parse(&direction)?,
                count.max(0) as u64,
                to_quantity(get(row, "total")?)?,
            );
        }
        Ok(summary)
    }

    async fn pair_history(&self, key: BalanceKey) -> LedgerResult<Vec<StockMovement>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM stock_movements
            WHERE product_id = $1 AND location_id = $2
            ORDER BY sequence ASC
            "#
        ))
        .bind(key.product_id.as_uuid())
        .bind(key.location_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pair_history", e))?;

        rows.iter().map(movement_from_row).collect()
    }

    async fn movement(&self, id: MovementId) -> LedgerResult<Option<StockMovement>> {
        let row = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movement", e))?;

        row.as_ref().map(movement_from_row).transpose()
    }

    async fn movement_by_key(&self, movement_key: &str) -> LedgerResult<Option<StockMovement>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        load_movement_by_key(&mut conn, movement_key).await
    }

    async fn insert_order_line(&self, line: OrderLine) -> LedgerResult<OrderLine> {
        let line_no = i32::try_from(line.line_no).map_err(|_| {
            LedgerError::validation(format!(
                "line number {} does not fit the order_lines table",
                line.line_no
            ))
        })?;
        sqlx::query(
            r#"
            INSERT INTO order_lines (
                id, kind, document_id, line_no, product_id, location_id, ordered, fulfilled, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(line.id.as_uuid())
        .bind(line.kind.as_str())
        .bind(line.document_id)
        .bind(line_no)
        .bind(line.product_id.as_uuid())
        .bind(line.location_id.as_uuid())
        .bind(line.ordered.as_decimal())
        .bind(line.fulfilled.as_decimal())
        .bind(line.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_order_line", e))?;

        Ok(line)
    }

    async fn set_ordered_quantity(
        &self,
        line_id: OrderLineId,
        ordered: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<OrderLine> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {ORDER_LINE_COLUMNS} FROM order_lines WHERE id = $1 FOR UPDATE"
        ))
        .bind(line_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_order_line", e))?
        .ok_or_else(|| line_not_found(line_id))?;

        let mut line = order_line_from_row(&row)?;
        line.set_ordered(ordered, at)?;

        sqlx::query("UPDATE order_lines SET ordered = $2, updated_at = $3 WHERE id = $1")
            .bind(line_id.as_uuid())
            .bind(line.ordered.as_decimal())
            .bind(line.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_ordered_quantity", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(line)
    }

    async fn order_line(&self, line_id: OrderLineId) -> LedgerResult<Option<OrderLine>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        load_order_line(&mut conn, line_id).await
    }

    async fn insert_adjustment(
        &self,
        adjustment: StockAdjustment,
    ) -> LedgerResult<StockAdjustment> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (confirmed_by, confirmed_at) = match adjustment.status() {
            AdjustmentStatus::Draft => (None, None),
            AdjustmentStatus::Confirmed(c) => (Some(*c.confirmed_by.as_uuid()), Some(c.confirmed_at)),
        };
        sqlx::query(
            r#"
            INSERT INTO stock_adjustments (
                id, location_id, adjustment_date, reason, status,
                confirmed_by, confirmed_at, created_by, created_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(adjustment.id().as_uuid())
        .bind(adjustment.location_id().as_uuid())
        .bind(adjustment.adjustment_date())
        .bind(adjustment.reason())
        .bind(adjustment.status().as_str())
        .bind(confirmed_by)
        .bind(confirmed_at)
        .bind(adjustment.created_by().as_uuid())
        .bind(adjustment.created_at())
        .bind(adjustment.version() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_adjustment", e))?;

        for line in adjustment.lines() {
            insert_adjustment_line(&mut tx, *adjustment.id(), line).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(adjustment)
    }

    async fn add_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        product_id: ProductId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut adjustment = load_adjustment(&mut tx, adjustment_id, true)
            .await?
            .ok_or_else(|| adjustment_not_found(adjustment_id))?;
        let key = BalanceKey::new(product_id, adjustment.location_id());
        let before = load_balance(&mut tx, key)
            .await?
            .map(|b| b.on_hand)
            .unwrap_or(Quantity::ZERO);

        let line = adjustment
            .add_line(line_id, product_id, before, counted)?
            .clone();
        insert_adjustment_line(&mut tx, adjustment_id, &line).await?;
        bump_adjustment_version(&mut tx, &adjustment).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(adjustment)
    }

    async fn update_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut adjustment = load_adjustment(&mut tx, adjustment_id, true)
            .await?
            .ok_or_else(|| adjustment_not_found(adjustment_id))?;
        let line = adjustment.update_line(line_id, counted)?.clone();

        sqlx::query(
            "UPDATE stock_adjustment_lines SET quantity_after = $2, difference = $3 WHERE id = $1",
        )
        .bind(line.id.as_uuid())
        .bind(line.quantity_after.as_decimal())
        .bind(line.difference.as_decimal())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_adjustment_line", e))?;
        bump_adjustment_version(&mut tx, &adjustment).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(adjustment)
    }

    async fn remove_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
    ) -> LedgerResult<StockAdjustment> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut adjustment = load_adjustment(&mut tx, adjustment_id, true)
            .await?
            .ok_or_else(|| adjustment_not_found(adjustment_id))?;
        adjustment.remove_line(line_id)?;

        sqlx::query("DELETE FROM stock_adjustment_lines WHERE id = $1")
            .bind(line_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove_adjustment_line", e))?;
        bump_adjustment_version(&mut tx, &adjustment).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(adjustment)
    }

    async fn adjustment(
        &self,
        adjustment_id: AdjustmentId,
    ) -> LedgerResult<Option<StockAdjustment>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        load_adjustment(&mut conn, adjustment_id, false).await
    }

    async fn adjustments(&self, filter: &AdjustmentFilter) -> LedgerResult<Vec<StockAdjustment>> {
        let status = filter.status.map(|s| match s {
            AdjustmentState::Draft => "draft",
            AdjustmentState::Confirmed => "confirmed",
        });
        let headers = sqlx::query(&format!(
            r#"
            SELECT {ADJUSTMENT_COLUMNS}
            FROM stock_adjustments
            WHERE ($1::uuid IS NULL OR location_id = $1)
                AND ($2::text IS NULL OR status = $2)
            ORDER BY adjustment_date DESC, created_at DESC
            "#
        ))
        .bind(filter.location_id.map(|l| *l.as_uuid()))
        .bind(status)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_adjustments", e))?;

        let ids = headers
            .iter()
            .map(|r| get::<Uuid>(r, "id"))
            .collect::<LedgerResult<Vec<_>>>()?;
        let line_rows = sqlx::query(
            r#"
            SELECT id, adjustment_id, product_id, quantity_before, quantity_after, difference
            FROM stock_adjustment_lines
            WHERE adjustment_id = ANY($1)
            ORDER BY seq ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_adjustment_lines", e))?;

        let mut lines: HashMap<Uuid, Vec<StockAdjustmentLine>> = HashMap::new();
        for row in &line_rows {
            let adjustment_id: Uuid = get(row, "adjustment_id")?;
            lines
                .entry(adjustment_id)
                .or_default()
                .push(adjustment_line_from_row(row)?);
        }

        headers
            .iter()
            .map(|row| {
                let id: Uuid = get(row, "id")?;
                adjustment_from_row(row, lines.remove(&id).unwrap_or_default())
            })
            .collect()
    }
}

async fn apply_unit(conn: &mut PgConnection, work: UnitOfWork) -> LedgerResult<CommitReceipt> {
    let pair_keys = work.balance_keys();
    let UnitOfWork {
        movements: drafts,
        releases,
        fulfillment,
        confirm_adjustment,
        recorded_at,
    } = work;

    // Cheap early exit for plain retries; the ON CONFLICT below covers races.
    for draft in &drafts {
        if let Some(existing) = load_movement_by_key(conn, &draft.movement_key).await? {
            return Err(duplicate(existing));
        }
    }

    if let Some(c) = &confirm_adjustment {
        let row = sqlx::query("SELECT status, version FROM stock_adjustments WHERE id = $1 FOR UPDATE")
            .bind(c.adjustment_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("lock_adjustment", e))?
            .ok_or_else(|| adjustment_not_found(c.adjustment_id))?;
        let status: String = get(&row, "status")?;
        let version: i64 = get(&row, "version")?;
        if status != "draft" {
            return Err(StockError::AlreadyConfirmed(c.adjustment_id).into());
        }
        ExpectedVersion::Exact(c.expected_version).check(version as u64)?;

        sqlx::query(
            r#"
            UPDATE stock_adjustments
            SET status = 'confirmed', confirmed_by = $2, confirmed_at = $3, version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(c.adjustment_id.as_uuid())
        .bind(c.confirmation.confirmed_by.as_uuid())
        .bind(c.confirmation.confirmed_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("confirm_adjustment", e))?;
    }

    let order_line = match &fulfillment {
        Some(f) => {
            let row = sqlx::query(&format!(
                r#"
                UPDATE order_lines
                SET fulfilled = fulfilled + $2, updated_at = $3
                WHERE id = $1 AND fulfilled + $2 <= ordered
                RETURNING {ORDER_LINE_COLUMNS}
                "#
            ))
            .bind(f.line_id.as_uuid())
            .bind(f.quantity.as_decimal())
            .bind(recorded_at)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("increment_fulfilled", e))?;

            match row {
                Some(row) => Some(order_line_from_row(&row)?),
                None => {
                    let current = load_order_line(conn, f.line_id)
                        .await?
                        .ok_or_else(|| line_not_found(f.line_id))?;
                    return Err(StockError::OverFulfillment {
                        line_id: f.line_id,
                        ordered: current.ordered,
                        fulfilled: current.fulfilled,
                        requested: f.quantity,
                    }
                    .into());
                }
            }
        }
        None => None,
    };

    let moved: Vec<BalanceKey> = drafts.iter().map(MovementDraft::balance_key).collect();
    lock_pairs(conn, &pair_keys, &moved).await?;

    let mut release_results = Vec::with_capacity(releases.len());
    for (key, qty) in &releases {
        let row = sqlx::query(RELEASE_SQL)
            .bind(key.product_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .bind(qty.as_decimal())
            .bind(recorded_at)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("release_reservation", e))?;
        let released = match row {
            Some(row) => (*qty).min(to_quantity(get(&row, "previous_reserved")?)?),
            None => Quantity::ZERO,
        };
        release_results.push(Release {
            requested: *qty,
            released,
        });
    }

    let mut committed = Vec::with_capacity(drafts.len());
    let mut truncated = Vec::new();
    for draft in drafts {
        let key = draft.balance_key();
        let id = MovementId::generate();
        let sequence = insert_movement(conn, id, &draft, recorded_at).await?;
        if let Some(cut) = apply_delta(conn, &draft, recorded_at).await? {
            truncated.push((key, cut));
        }
        committed.push(StockMovement::from_draft(draft, id, sequence, recorded_at));
    }

    let mut balances = Vec::with_capacity(pair_keys.len());
    for key in pair_keys {
        balances.push(
            load_balance(conn, key)
                .await?
                .unwrap_or_else(|| StockBalance::empty(key)),
        );
    }

    let adjustment = match &confirm_adjustment {
        Some(c) => load_adjustment(conn, c.adjustment_id, false).await?,
        None => None,
    };

    Ok(CommitReceipt {
        movements: committed,
        balances,
        releases: release_results,
        truncated_reservations: truncated,
        order_line,
        adjustment,
    })
}

/// Lock every balance row the unit touches, in `pair_keys` order.
///
/// `pair_keys` is sorted, so two units touching the same pairs (opposite
/// transfers, say) queue instead of deadlocking. Rows are created first for
/// pairs that receive a movement; a release alone never creates a row.
async fn lock_pairs(
    conn: &mut PgConnection,
    pair_keys: &[BalanceKey],
    moved: &[BalanceKey],
) -> LedgerResult<()> {
    for key in pair_keys {
        if moved.contains(key) {
            sqlx::query(
                r#"
                INSERT INTO stock_balances (product_id, location_id, on_hand, reserved, updated_at)
                VALUES ($1, $2, 0, 0, NULL)
                ON CONFLICT (product_id, location_id) DO NOTHING
                "#,
            )
            .bind(key.product_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("ensure_balance_row", e))?;
        }
        sqlx::query(
            "SELECT 1 FROM stock_balances WHERE product_id = $1 AND location_id = $2 FOR UPDATE",
        )
        .bind(key.product_id.as_uuid())
        .bind(key.location_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_balance", e))?;
    }
    Ok(())
}

/// Insert a movement row; returns its commit sequence.
async fn insert_movement(
    conn: &mut PgConnection,
    id: MovementId,
    draft: &MovementDraft,
    recorded_at: DateTime<Utc>,
) -> LedgerResult<u64> {
    let row = sqlx::query(
        r#"
        INSERT INTO stock_movements (
            id, movement_key, product_id, location_id, kind, direction, quantity,
            reference_type, reference_id, effective_at, recorded_at, note, floor_policy, posted_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (movement_key) DO NOTHING
        RETURNING sequence
        "#,
    )
    .bind(id.as_uuid())
    .bind(&draft.movement_key)
    .bind(draft.product_id.as_uuid())
    .bind(draft.location_id.as_uuid())
    .bind(draft.kind.as_str())
    .bind(draft.direction.as_str())
    .bind(draft.quantity.as_decimal())
    .bind(draft.reference.map(|r| r.reference_type.as_str()))
    .bind(draft.reference.map(|r| r.reference_id))
    .bind(draft.effective_at)
    .bind(recorded_at)
    .bind(draft.note.as_deref())
    .bind(draft.floor.as_str())
    .bind(draft.posted_by.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_movement", e))?;

    match row {
        Some(row) => {
            let sequence: i64 = get(&row, "sequence")?;
            Ok(sequence as u64)
        }
        None => match load_movement_by_key(conn, &draft.movement_key).await? {
            Some(existing) => Err(duplicate(existing)),
            None => Err(LedgerError::Conflict(format!(
                "movement key '{}' collided with a concurrent commit",
                draft.movement_key
            ))),
        },
    }
}

/// `on_hand += delta` for the draft's pair; returns the reservation cut by an
/// unchecked decrease, if any.
async fn apply_delta(
    conn: &mut PgConnection,
    draft: &MovementDraft,
    at: DateTime<Utc>,
) -> LedgerResult<Option<Quantity>> {
    let key = draft.balance_key();
    let delta = draft.signed_delta();

    sqlx::query(
        r#"
        INSERT INTO stock_balances (product_id, location_id, on_hand, reserved, updated_at)
        VALUES ($1, $2, 0, 0, NULL)
        ON CONFLICT (product_id, location_id) DO NOTHING
        "#,
    )
    .bind(key.product_id.as_uuid())
    .bind(key.location_id.as_uuid())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("ensure_balance_row", e))?;

    match draft.floor {
        FloorPolicy::Enforced => {
            let updated = sqlx::query(
                r#"
                UPDATE stock_balances
                SET on_hand = on_hand + $3, updated_at = $4
                WHERE product_id = $1 AND location_id = $2
                    AND ($3 >= 0 OR on_hand + $3 >= reserved)
                "#,
            )
            .bind(key.product_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .bind(delta.as_decimal())
            .bind(at)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("apply_delta", e))?;

            if updated.rows_affected() == 0 {
                let current = load_balance(conn, key)
                    .await?
                    .unwrap_or_else(|| StockBalance::empty(key));
                return Err(StockError::InsufficientStock {
                    product_id: key.product_id,
                    location_id: key.location_id,
                    requested: draft.quantity,
                    available: current.available(),
                }
                .into());
            }
            Ok(None)
        }
        FloorPolicy::Unchecked => {
            let row = sqlx::query(
                r#"
                WITH prev AS (
                    SELECT product_id, location_id, reserved
                    FROM stock_balances
                    WHERE product_id = $1 AND location_id = $2
                    FOR UPDATE
                )
                UPDATE stock_balances b
                SET on_hand = b.on_hand + $3,
                    reserved = LEAST(b.reserved, GREATEST(b.on_hand + $3, 0)),
                    updated_at = $4
                FROM prev
                WHERE b.product_id = prev.product_id AND b.location_id = prev.location_id
                RETURNING b.reserved AS reserved, prev.reserved AS previous_reserved
                "#,
            )
            .bind(key.product_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .bind(delta.as_decimal())
            .bind(at)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("apply_unchecked_delta", e))?;

            let reserved = to_quantity(get(&row, "reserved")?)?;
            let previous = to_quantity(get(&row, "previous_reserved")?)?;
            Ok((previous > reserved).then(|| previous - reserved))
        }
    }
}

async fn load_balance(conn: &mut PgConnection, key: BalanceKey) -> LedgerResult<Option<StockBalance>> {
    let row = sqlx::query(&format!(
        "SELECT {BALANCE_COLUMNS} FROM stock_balances WHERE product_id = $1 AND location_id = $2"
    ))
    .bind(key.product_id.as_uuid())
    .bind(key.location_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_balance", e))?;

    row.as_ref().map(balance_from_row).transpose()
}

async fn load_movement_by_key(
    conn: &mut PgConnection,
    movement_key: &str,
) -> LedgerResult<Option<StockMovement>> {
    let row = sqlx::query(&format!(
        "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE movement_key = $1"
    ))
    .bind(movement_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_movement_by_key", e))?;

    row.as_ref().map(movement_from_row).transpose()
}

async fn load_order_line(conn: &mut PgConnection, line_id: OrderLineId) -> LedgerResult<Option<OrderLine>> {
    let row = sqlx::query(&format!(
        "SELECT {ORDER_LINE_COLUMNS} FROM order_lines WHERE id = $1"
    ))
    .bind(line_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_order_line", e))?;

    row.as_ref().map(order_line_from_row).transpose()
}

/// Load a header with its lines; `for_update` locks the header row.
async fn load_adjustment(
    conn: &mut PgConnection,
    adjustment_id: AdjustmentId,
    for_update: bool,
) -> LedgerResult<Option<StockAdjustment>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let Some(header) = sqlx::query(&format!(
        "SELECT {ADJUSTMENT_COLUMNS} FROM stock_adjustments WHERE id = $1{lock}"
    ))
    .bind(adjustment_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_adjustment", e))?
    else {
        return Ok(None);
    };

    let line_rows = sqlx::query(
        r#"
        SELECT id, product_id, quantity_before, quantity_after, difference
        FROM stock_adjustment_lines
        WHERE adjustment_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(adjustment_id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_adjustment_lines", e))?;

    let lines = line_rows
        .iter()
        .map(adjustment_line_from_row)
        .collect::<LedgerResult<Vec<_>>>()?;
    adjustment_from_row(&header, lines).map(Some)
}

async fn insert_adjustment_line(
    conn: &mut PgConnection,
    adjustment_id: AdjustmentId,
    line: &StockAdjustmentLine,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO stock_adjustment_lines (
            id, adjustment_id, product_id, quantity_before, quantity_after, difference
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(line.id.as_uuid())
    .bind(adjustment_id.as_uuid())
    .bind(line.product_id.as_uuid())
    .bind(line.quantity_before.as_decimal())
    .bind(line.quantity_after.as_decimal())
    .bind(line.difference.as_decimal())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_adjustment_line", e))?;
    Ok(())
}

async fn bump_adjustment_version(
    conn: &mut PgConnection,
    adjustment: &StockAdjustment,
) -> LedgerResult<()> {
    sqlx::query("UPDATE stock_adjustments SET version = $2 WHERE id = $1")
        .bind(adjustment.id().as_uuid())
        .bind(adjustment.version() as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("bump_adjustment_version", e))?;
    Ok(())
}

fn bind_movement_filter<'q>(
    query: Query<'q, Postgres, PgArguments>,
    filter: &MovementFilter,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(filter.product_id.map(|p| *p.as_uuid()))
        .bind(filter.location_id.map(|l| *l.as_uuid()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.reference.map(|r| r.reference_type.as_str()))
        .bind(filter.reference.map(|r| r.reference_id))
        .bind(filter.date_from)
        .bind(filter.date_to)
}

fn duplicate(existing: StockMovement) -> LedgerError {
    LedgerError::DuplicateMovement {
        key: existing.movement_key.clone(),
        existing: Box::new(existing),
    }
}

fn line_not_found(id: OrderLineId) -> LedgerError {
    LedgerError::NotFound(format!("order line {id}"))
}

fn adjustment_not_found(id: AdjustmentId) -> LedgerError {
    LedgerError::NotFound(format!("stock adjustment {id}"))
}

// Row mapping

fn get<'r, T>(row: &'r PgRow, column: &str) -> LedgerResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| LedgerError::storage(format!("failed to read column '{column}': {e}")))
}

fn to_quantity(value: Decimal) -> LedgerResult<Quantity> {
    Ok(Quantity::new(value)?)
}

fn movement_from_row(row: &PgRow) -> LedgerResult<StockMovement> {
    let id: Uuid = get(row, "id")?;
    let sequence: i64 = get(row, "sequence")?;
    let product_id: Uuid = get(row, "product_id")?;
    let location_id: Uuid = get(row, "location_id")?;
    let kind: String = get(row, "kind")?;
    let direction: String = get(row, "direction")?;
    let reference_type: Option<String> = get(row, "reference_type")?;
    let reference_id: Option<Uuid> = get(row, "reference_id")?;
    let floor: String = get(row, "floor_policy")?;
    let posted_by: Uuid = get(row, "posted_by")?;

    let reference = match (reference_type, reference_id) {
        (Some(t), Some(rid)) => Some(MovementReference::new(ReferenceType::parse(&t)?, rid)),
        _ => None,
    };

    Ok(StockMovement {
        id: MovementId::from(id),
        sequence: sequence as u64,
        movement_key: get(row, "movement_key")?,
        product_id: ProductId::from(product_id),
        location_id: location_id.into(),
        kind: MovementKind::parse(&kind)?,
        direction: Direction::parse(&direction)?,
        quantity: to_quantity(get(row, "quantity")?)?,
        reference,
        effective_at: get(row, "effective_at")?,
        recorded_at: get(row, "recorded_at")?,
        note: get(row, "note")?,
        floor: FloorPolicy::parse(&floor)?,
        posted_by: UserId::from_uuid(posted_by),
    })
}

fn balance_from_row(row: &PgRow) -> LedgerResult<StockBalance> {
    let product_id: Uuid = get(row, "product_id")?;
    let location_id: Uuid = get(row, "location_id")?;
    Ok(StockBalance {
        product_id: product_id.into(),
        location_id: location_id.into(),
        on_hand: to_quantity(get(row, "on_hand")?)?,
        reserved: to_quantity(get(row, "reserved")?)?,
        updated_at: get(row, "updated_at")?,
    })
}

fn order_line_from_row(row: &PgRow) -> LedgerResult<OrderLine> {
    let id: Uuid = get(row, "id")?;
    let kind: String = get(row, "kind")?;
    let line_no: i32 = get(row, "line_no")?;
    let product_id: Uuid = get(row, "product_id")?;
    let location_id: Uuid = get(row, "location_id")?;
    Ok(OrderLine {
        id: id.into(),
        kind: OrderKind::parse(&kind)?,
        document_id: get(row, "document_id")?,
        line_no: u32::try_from(line_no)
            .map_err(|_| LedgerError::storage(format!("negative line number {line_no}")))?,
        product_id: product_id.into(),
        location_id: location_id.into(),
        ordered: to_quantity(get(row, "ordered")?)?,
        fulfilled: to_quantity(get(row, "fulfilled")?)?,
        updated_at: get(row, "updated_at")?,
    })
}

fn adjustment_line_from_row(row: &PgRow) -> LedgerResult<StockAdjustmentLine> {
    let id: Uuid = get(row, "id")?;
    let product_id: Uuid = get(row, "product_id")?;
    Ok(StockAdjustmentLine {
        id: AdjustmentLineId::from(id),
        product_id: product_id.into(),
        quantity_before: to_quantity(get(row, "quantity_before")?)?,
        quantity_after: to_quantity(get(row, "quantity_after")?)?,
        difference: to_quantity(get(row, "difference")?)?,
    })
}

fn adjustment_from_row(row: &PgRow, lines: Vec<StockAdjustmentLine>) -> LedgerResult<StockAdjustment> {
    let id: Uuid = get(row, "id")?;
    let location_id: Uuid = get(row, "location_id")?;
    let adjustment_date: NaiveDate = get(row, "adjustment_date")?;
    let status: String = get(row, "status")?;
    let confirmed_by: Option<Uuid> = get(row, "confirmed_by")?;
    let confirmed_at: Option<DateTime<Utc>> = get(row, "confirmed_at")?;
    let created_by: Uuid = get(row, "created_by")?;
    let version: i64 = get(row, "version")?;

    let status = match (status.as_str(), confirmed_by, confirmed_at) {
        ("draft", _, _) => AdjustmentStatus::Draft,
        ("confirmed", Some(by), Some(at)) => AdjustmentStatus::Confirmed(Confirmation {
            confirmed_by: UserId::from_uuid(by),
            confirmed_at: at,
        }),
        (other, _, _) => {
            return Err(LedgerError::storage(format!(
                "adjustment {id} has inconsistent status '{other}'"
            )));
        }
    };

    Ok(StockAdjustment::rehydrate(
        id.into(),
        location_id.into(),
        adjustment_date,
        get(row, "reason")?,
        status,
        lines,
        UserId::from_uuid(created_by),
        get(row, "created_at")?,
        version as u64,
    ))
}

/// Map SQLx errors to `LedgerError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => LedgerError::Conflict(msg),
                Some("23514") => LedgerError::Validation(msg),
                Some("40001") | Some("40P01") => LedgerError::Conflict(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            LedgerError::storage(format!("unexpected row not found in {operation}"))
        }
        other => LedgerError::storage(format!("sqlx error in {operation}: {other}")),
    }
}
