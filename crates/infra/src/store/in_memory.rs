//! In-memory ledger store.
//!
//! Locking model:
//! - one mutex per (product, location) pair, guarding its balance row and its
//!   movement history together;
//! - one mutex per order line and per adjustment;
//! - a short-lived key index claim for idempotency keys, settled before the
//!   pair locks are released.
//!
//! A unit of work locks its adjustment, then its order line, then its pairs in
//! sorted key order, stages every change on copies, and only writes once all
//! checks passed. Different pairs never contend. Listings that span pairs
//! read each pair consistently but are not a cross-pair snapshot.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tracing::error;

use stockpile_core::{AggregateRoot, ExpectedVersion, Quantity};
use stockpile_inventory::{
    AdjustmentId, AdjustmentLineId, BalanceKey, MovementDraft, MovementId, OrderLine, OrderLineId,
    ProductId, Release, StockAdjustment, StockBalance, StockError, StockMovement,
};

use super::query::{
    AdjustmentFilter, AdjustmentState, BalanceFilter, MovementFilter, MovementSummary, Page,
    Pagination,
};
use super::{CommitReceipt, LedgerStore, UnitOfWork};
use crate::error::{LedgerError, LedgerResult};

const SHARD_COUNT: usize = 32;

type Slot<V> = Arc<Mutex<V>>;

/// Hash-sharded map of individually locked slots.
struct ShardedMap<K, V> {
    shards: Vec<RwLock<HashMap<K, Slot<V>>>>,
}

impl<K: Eq + Hash + Clone, V> ShardedMap<K, V> {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, Slot<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn get(&self, key: &K) -> LedgerResult<Option<Slot<V>>> {
        let shard = self.shard(key).read().map_err(|_| poisoned())?;
        Ok(shard.get(key).cloned())
    }

    fn get_or_insert_with(&self, key: &K, init: impl FnOnce() -> V) -> LedgerResult<Slot<V>> {
        if let Some(slot) = self.get(key)? {
            return Ok(slot);
        }
        let mut shard = self.shard(key).write().map_err(|_| poisoned())?;
        Ok(shard
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone())
    }

    /// Returns `false` if the key already exists.
    fn insert_new(&self, key: K, value: V) -> LedgerResult<bool> {
        let mut shard = self.shard(&key).write().map_err(|_| poisoned())?;
        if shard.contains_key(&key) {
            return Ok(false);
        }
        shard.insert(key, Arc::new(Mutex::new(value)));
        Ok(true)
    }

    fn values(&self) -> LedgerResult<Vec<Slot<V>>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().map_err(|_| poisoned())?;
            out.extend(shard.values().cloned());
        }
        Ok(out)
    }
}

#[derive(Default)]
struct PairSlot {
    /// `None` until the first movement for the pair.
    balance: Option<StockBalance>,
    /// Commit order.
    movements: Vec<StockMovement>,
}

enum KeySlot {
    /// Claimed by a commit in progress.
    Pending,
    Committed(StockMovement),
}

/// In-memory [`LedgerStore`]. Not durable.
pub struct InMemoryLedgerStore {
    pairs: ShardedMap<BalanceKey, PairSlot>,
    lines: ShardedMap<OrderLineId, OrderLine>,
    adjustments: ShardedMap<AdjustmentId, StockAdjustment>,
    keys: RwLock<HashMap<String, KeySlot>>,
    by_id: RwLock<HashMap<MovementId, StockMovement>>,
    sequence: AtomicU64,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedgerStore")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            pairs: ShardedMap::new(),
            lines: ShardedMap::new(),
            adjustments: ShardedMap::new(),
            keys: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    fn commit_sync(&self, work: UnitOfWork) -> LedgerResult<CommitReceipt> {
        work.validate()?;
        let claimed = self.claim_keys(&work.movements)?;
        match self.apply(work) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                self.release_claims(&claimed);
                Err(err)
            }
        }
    }

    fn claim_keys(&self, drafts: &[MovementDraft]) -> LedgerResult<Vec<String>> {
        let mut keys = self.keys.write().map_err(|_| poisoned())?;
        for draft in drafts {
            match keys.get(&draft.movement_key) {
                Some(KeySlot::Committed(existing)) => {
                    return Err(LedgerError::DuplicateMovement {
                        key: draft.movement_key.clone(),
                        existing: Box::new(existing.clone()),
                    });
                }
                Some(KeySlot::Pending) => {
                    return Err(LedgerError::Conflict(format!(
                        "movement key '{}' is being committed by another request",
                        draft.movement_key
                    )));
                }
                None => {}
            }
        }
        let claimed: Vec<String> = drafts.iter().map(|d| d.movement_key.clone()).collect();
        for key in &claimed {
            keys.insert(key.clone(), KeySlot::Pending);
        }
        Ok(claimed)
    }

    fn release_claims(&self, claimed: &[String]) {
        match self.keys.write() {
            Ok(mut keys) => {
                for key in claimed {
                    if matches!(keys.get(key), Some(KeySlot::Pending)) {
                        keys.remove(key);
                    }
                }
            }
            Err(_) => error!(count = claimed.len(), "could not release movement key claims"),
        }
    }

    fn apply(&self, work: UnitOfWork) -> LedgerResult<CommitReceipt> {
        let pair_keys = work.balance_keys();
        let UnitOfWork {
            movements: drafts,
            releases,
            fulfillment,
            confirm_adjustment,
            recorded_at,
        } = work;

        // 1. adjustment header
        let adjustment_slot = match &confirm_adjustment {
            Some(c) => Some(
                self.adjustments
                    .get(&c.adjustment_id)?
                    .ok_or_else(|| adjustment_not_found(c.adjustment_id))?,
            ),
            None => None,
        };
        let mut adjustment_guard = adjustment_slot.as_ref().map(lock).transpose()?;
        let mut confirmed = None;
        if let (Some(c), Some(current)) = (&confirm_adjustment, adjustment_guard.as_deref()) {
            if !current.is_draft() {
                return Err(StockError::AlreadyConfirmed(c.adjustment_id).into());
            }
            ExpectedVersion::Exact(c.expected_version).check(current.version())?;
            let mut next = current.clone();
            next.confirm(c.confirmation)?;
            confirmed = Some(next);
        }

        // 2. fulfillment counter
        let line_slot = match &fulfillment {
            Some(f) => Some(
                self.lines
                    .get(&f.line_id)?
                    .ok_or_else(|| line_not_found(f.line_id))?,
            ),
            None => None,
        };
        let mut line_guard = line_slot.as_ref().map(lock).transpose()?;
        let mut next_line = None;
        if let (Some(f), Some(current)) = (&fulfillment, line_guard.as_deref()) {
            let mut line = current.clone();
            line.increment(f.quantity, recorded_at)?;
            next_line = Some(line);
        }

        // 3. pairs, in key order
        let slots = pair_keys
            .iter()
            .map(|k| self.pairs.get_or_insert_with(k, PairSlot::default))
            .collect::<LedgerResult<Vec<_>>>()?;
        let mut guards = slots
            .iter()
            .map(lock)
            .collect::<LedgerResult<Vec<_>>>()?;

        let mut staged: Vec<StockBalance> = pair_keys
            .iter()
            .zip(guards.iter())
            .map(|(k, g)| g.balance.clone().unwrap_or_else(|| StockBalance::empty(*k)))
            .collect();
        let mut moved = vec![false; pair_keys.len()];

        let mut release_results = Vec::with_capacity(releases.len());
        for (key, qty) in &releases {
            let i = slot_index(&pair_keys, key)?;
            release_results.push(staged[i].release(*qty, recorded_at)?);
        }

        let mut draft_slots = Vec::with_capacity(drafts.len());
        let mut truncated = Vec::new();
        for draft in &drafts {
            let key = draft.balance_key();
            let i = slot_index(&pair_keys, &key)?;
            let effect = staged[i].apply_delta(draft.signed_delta(), draft.floor, recorded_at)?;
            if let Some(cut) = effect.reservation_truncated {
                truncated.push((key, cut));
            }
            moved[i] = true;
            draft_slots.push(i);
        }

        // The key index is settled while the pair guards are still held, so a
        // movement is never visible in a pair history with its key pending.
        let mut keys = self.keys.write().map_err(|_| poisoned())?;
        let mut by_id = self.by_id.write().map_err(|_| poisoned())?;

        // 4. write; nothing below can fail
        let mut committed = Vec::with_capacity(drafts.len());
        for (draft, i) in drafts.into_iter().zip(draft_slots) {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let movement =
                StockMovement::from_draft(draft, MovementId::generate(), sequence, recorded_at);
            guards[i].movements.push(movement.clone());
            keys.insert(movement.movement_key.clone(), KeySlot::Committed(movement.clone()));
            by_id.insert(movement.id, movement.clone());
            committed.push(movement);
        }
        drop(by_id);
        drop(keys);

        let mut balances = Vec::with_capacity(pair_keys.len());
        for (i, guard) in guards.iter_mut().enumerate() {
            if guard.balance.is_some() || moved[i] {
                guard.balance = Some(staged[i].clone());
                balances.push(staged[i].clone());
            } else {
                balances.push(StockBalance::empty(pair_keys[i]));
            }
        }

        if let (Some(line), Some(guard)) = (&next_line, line_guard.as_deref_mut()) {
            *guard = line.clone();
        }
        if let (Some(adj), Some(guard)) = (&confirmed, adjustment_guard.as_deref_mut()) {
            *guard = adj.clone();
        }

        Ok(CommitReceipt {
            movements: committed,
            balances,
            releases: release_results,
            truncated_reservations: truncated,
            order_line: next_line,
            adjustment: confirmed,
        })
    }

    fn reserve_sync(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<StockBalance> {
        let slot = self.pairs.get_or_insert_with(&key, PairSlot::default)?;
        let mut guard = lock(&slot)?;
        let mut balance = guard
            .balance
            .clone()
            .unwrap_or_else(|| StockBalance::empty(key));
        balance.reserve(quantity, at)?;
        guard.balance = Some(balance.clone());
        Ok(balance)
    }

    fn release_sync(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<(StockBalance, Release)> {
        let Some(slot) = self.pairs.get(&key)? else {
            let mut empty = StockBalance::empty(key);
            let release = empty.release(quantity, at)?;
            return Ok((StockBalance::empty(key), release));
        };
        let mut guard = lock(&slot)?;
        let mut balance = guard
            .balance
            .clone()
            .unwrap_or_else(|| StockBalance::empty(key));
        let release = balance.release(quantity, at)?;
        if guard.balance.is_some() {
            guard.balance = Some(balance.clone());
        }
        Ok((balance, release))
    }

    fn balance_sync(&self, key: BalanceKey) -> LedgerResult<Option<StockBalance>> {
        match self.pairs.get(&key)? {
            Some(slot) => Ok(lock(&slot)?.balance.clone()),
            None => Ok(None),
        }
    }

    fn balances_sync(&self, filter: &BalanceFilter) -> LedgerResult<Vec<StockBalance>> {
        let mut out = Vec::new();
        for slot in self.pairs.values()? {
            let guard = lock(&slot)?;
            if let Some(b) = &guard.balance {
                if filter.matches(b) {
                    out.push(b.clone());
                }
            }
        }
        Ok(out)
    }

    /// Matching movements, unordered.
    fn matching_movements(&self, filter: &MovementFilter) -> LedgerResult<Vec<StockMovement>> {
        let slots: Vec<Slot<PairSlot>> = match (filter.product_id, filter.location_id) {
            (Some(p), Some(l)) => self
                .pairs
                .get(&BalanceKey::new(p, l))?
                .into_iter()
                .collect(),
            _ => self.pairs.values()?,
        };
        let mut out = Vec::new();
        for slot in slots {
            let guard = lock(&slot)?;
            out.extend(guard.movements.iter().filter(|m| filter.matches(m)).cloned());
        }
        Ok(out)
    }

    fn movements_sync(
        &self,
        filter: &MovementFilter,
        page: Pagination,
    ) -> LedgerResult<Page<StockMovement>> {
        let mut found = self.matching_movements(filter)?;
        found.sort_by(|a, b| {
            b.effective_at
                .cmp(&a.effective_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        Ok(page.apply(found))
    }

    fn summarize_sync(&self, filter: &MovementFilter) -> LedgerResult<MovementSummary> {
        let mut summary = MovementSummary::default();
        for m in self.matching_movements(filter)? {
            summary.record(m.kind, m.direction, m.quantity);
        }
        Ok(summary)
    }

    fn pair_history_sync(&self, key: BalanceKey) -> LedgerResult<Vec<StockMovement>> {
        match self.pairs.get(&key)? {
            Some(slot) => Ok(lock(&slot)?.movements.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn movement_by_key_sync(&self, movement_key: &str) -> LedgerResult<Option<StockMovement>> {
        let keys = self.keys.read().map_err(|_| poisoned())?;
        Ok(match keys.get(movement_key) {
            Some(KeySlot::Committed(m)) => Some(m.clone()),
            _ => None,
        })
    }

    fn set_ordered_sync(
        &self,
        line_id: OrderLineId,
        ordered: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<OrderLine> {
        let slot = self
            .lines
            .get(&line_id)?
            .ok_or_else(|| line_not_found(line_id))?;
        let mut guard = lock(&slot)?;
        guard.set_ordered(ordered, at)?;
        Ok(guard.clone())
    }

    fn with_adjustment<T>(
        &self,
        adjustment_id: AdjustmentId,
        f: impl FnOnce(&mut StockAdjustment) -> LedgerResult<T>,
    ) -> LedgerResult<StockAdjustment> {
        let slot = self
            .adjustments
            .get(&adjustment_id)?
            .ok_or_else(|| adjustment_not_found(adjustment_id))?;
        let mut guard = lock(&slot)?;
        f(&mut guard)?;
        Ok(guard.clone())
    }

    fn add_adjustment_line_sync(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        product_id: ProductId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        self.with_adjustment(adjustment_id, |adj| {
            let key = BalanceKey::new(product_id, adj.location_id());
            let before = self
                .balance_sync(key)?
                .map(|b| b.on_hand)
                .unwrap_or(Quantity::ZERO);
            adj.add_line(line_id, product_id, before, counted)?;
            Ok(())
        })
    }

    fn adjustments_sync(&self, filter: &AdjustmentFilter) -> LedgerResult<Vec<StockAdjustment>> {
        let mut out = Vec::new();
        for slot in self.adjustments.values()? {
            let adj = lock(&slot)?;
            let state = if adj.is_draft() {
                AdjustmentState::Draft
            } else {
                AdjustmentState::Confirmed
            };
            if filter.location_id.is_none_or(|l| l == adj.location_id())
                && filter.status.is_none_or(|s| s == state)
            {
                out.push(adj.clone());
            }
        }
        out.sort_by(|a, b| {
            b.adjustment_date()
                .cmp(&a.adjustment_date())
                .then(b.created_at().cmp(&a.created_at()))
        });
        Ok(out)
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn commit(&self, work: UnitOfWork) -> LedgerResult<CommitReceipt> {
        self.commit_sync(work)
    }

    async fn reserve(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<StockBalance> {
        self.reserve_sync(key, quantity, at)
    }

    async fn release(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<(StockBalance, Release)> {
        self.release_sync(key, quantity, at)
    }

    async fn balance(&self, key: BalanceKey) -> LedgerResult<Option<StockBalance>> {
        self.balance_sync(key)
    }

    async fn balances(&self, filter: &BalanceFilter) -> LedgerResult<Vec<StockBalance>> {
        self.balances_sync(filter)
    }

    async fn movements(
        &self,
        filter: &MovementFilter,
        page: Pagination,
    ) -> LedgerResult<Page<StockMovement>> {
        self.movements_sync(filter, page)
    }

    async fn summarize(&self, filter: &MovementFilter) -> LedgerResult<MovementSummary> {
        self.summarize_sync(filter)
    }

    async fn pair_history(&self, key: BalanceKey) -> LedgerResult<Vec<StockMovement>> {
        self.pair_history_sync(key)
    }

    async fn movement(&self, id: MovementId) -> LedgerResult<Option<StockMovement>> {
        let by_id = self.by_id.read().map_err(|_| poisoned())?;
        Ok(by_id.get(&id).cloned())
    }

    async fn movement_by_key(&self, movement_key: &str) -> LedgerResult<Option<StockMovement>> {
        self.movement_by_key_sync(movement_key)
    }

    async fn insert_order_line(&self, line: OrderLine) -> LedgerResult<OrderLine> {
        if !self.lines.insert_new(line.id, line.clone())? {
            return Err(LedgerError::Conflict(format!(
                "order line {} already registered",
                line.id
            )));
        }
        Ok(line)
    }

    async fn set_ordered_quantity(
        &self,
        line_id: OrderLineId,
        ordered: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<OrderLine> {
        self.set_ordered_sync(line_id, ordered, at)
    }

    async fn order_line(&self, line_id: OrderLineId) -> LedgerResult<Option<OrderLine>> {
        match self.lines.get(&line_id)? {
            Some(slot) => Ok(Some(lock(&slot)?.clone())),
            None => Ok(None),
        }
    }

    async fn insert_adjustment(
        &self,
        adjustment: StockAdjustment,
    ) -> LedgerResult<StockAdjustment> {
        let id = *adjustment.id();
        if !self.adjustments.insert_new(id, adjustment.clone())? {
            return Err(LedgerError::Conflict(format!(
                "stock adjustment {id} already exists"
            )));
        }
        Ok(adjustment)
    }

    async fn add_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        product_id: ProductId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        self.add_adjustment_line_sync(adjustment_id, line_id, product_id, counted)
    }

    async fn update_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        self.with_adjustment(adjustment_id, |adj| {
            adj.update_line(line_id, counted)?;
            Ok(())
        })
    }

    async fn remove_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
    ) -> LedgerResult<StockAdjustment> {
        self.with_adjustment(adjustment_id, |adj| {
            adj.remove_line(line_id)?;
            Ok(())
        })
    }

    async fn adjustment(
        &self,
        adjustment_id: AdjustmentId,
    ) -> LedgerResult<Option<StockAdjustment>> {
        match self.adjustments.get(&adjustment_id)? {
            Some(slot) => Ok(Some(lock(&slot)?.clone())),
            None => Ok(None),
        }
    }

    async fn adjustments(&self, filter: &AdjustmentFilter) -> LedgerResult<Vec<StockAdjustment>> {
        self.adjustments_sync(filter)
    }
}

fn lock<V>(slot: &Slot<V>) -> LedgerResult<MutexGuard<'_, V>> {
    slot.lock().map_err(|_| poisoned())
}

fn poisoned() -> LedgerError {
    LedgerError::storage("in-memory store lock poisoned")
}

fn slot_index(keys: &[BalanceKey], key: &BalanceKey) -> LedgerResult<usize> {
    keys.binary_search(key)
        .map_err(|_| LedgerError::storage("balance key missing from the lock set"))
}

fn line_not_found(id: OrderLineId) -> LedgerError {
    LedgerError::NotFound(format!("order line {id}"))
}

fn adjustment_not_found(id: AdjustmentId) -> LedgerError {
    LedgerError::NotFound(format!("stock adjustment {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockpile_core::UserId;
    use stockpile_inventory::{Direction, LocationId, MovementKind};

    fn q(v: i64) -> Quantity {
        Quantity::from_i64(v)
    }

    fn draft(key: &str, pair: BalanceKey, kind: MovementKind, qty: i64) -> MovementDraft {
        let direction = match kind {
            MovementKind::In => Direction::Increase,
            _ => Direction::Decrease,
        };
        MovementDraft::new(
            key,
            pair.product_id,
            pair.location_id,
            kind,
            direction,
            q(qty),
            Utc::now(),
            UserId::new(),
        )
    }

    fn pair() -> BalanceKey {
        BalanceKey::new(ProductId::generate(), LocationId::generate())
    }

    #[tokio::test]
    async fn commit_updates_movement_log_and_balance_together() {
        let store = InMemoryLedgerStore::new();
        let p = pair();

        let receipt = store
            .commit(UnitOfWork::new(Utc::now()).movement(draft("R-1", p, MovementKind::In, 50)))
            .await
            .unwrap();
        assert_eq!(receipt.movements.len(), 1);
        assert_eq!(receipt.balance(p).unwrap().on_hand, q(50));

        let history = store.pair_history(p).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(store.balance(p).await.unwrap().unwrap().on_hand, q(50));
    }

    #[tokio::test]
    async fn failed_unit_leaves_no_trace() {
        let store = InMemoryLedgerStore::new();
        let a = pair();
        let b = pair();
        store
            .commit(UnitOfWork::new(Utc::now()).movement(draft("R-1", a, MovementKind::In, 5)))
            .await
            .unwrap();

        // second movement fails the floor check, first must not land
        let work = UnitOfWork::new(Utc::now())
            .movement(draft("X-1", a, MovementKind::Out, 2))
            .movement(draft("X-2", b, MovementKind::Out, 1));
        let err = store.commit(work).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Stock(StockError::InsufficientStock { .. })
        ));

        assert_eq!(store.balance(a).await.unwrap().unwrap().on_hand, q(5));
        assert!(store.balance(b).await.unwrap().is_none());
        assert!(store.movement_by_key("X-1").await.unwrap().is_none());

        // the claim was released: the same key can be used again
        store
            .commit(UnitOfWork::new(Utc::now()).movement(draft("X-1", a, MovementKind::Out, 2)))
            .await
            .unwrap();
        assert_eq!(store.balance(a).await.unwrap().unwrap().on_hand, q(3));
    }

    #[tokio::test]
    async fn duplicate_key_returns_the_committed_movement() {
        let store = InMemoryLedgerStore::new();
        let p = pair();
        let first = store
            .commit(UnitOfWork::new(Utc::now()).movement(draft("R-1", p, MovementKind::In, 10)))
            .await
            .unwrap();

        let err = store
            .commit(UnitOfWork::new(Utc::now()).movement(draft("R-1", p, MovementKind::In, 10)))
            .await
            .unwrap_err();
        match err {
            LedgerError::DuplicateMovement { key, existing } => {
                assert_eq!(key, "R-1");
                assert_eq!(existing.id, first.movements[0].id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.balance(p).await.unwrap().unwrap().on_hand, q(10));
    }

    #[test]
    fn visible_movements_always_have_a_settled_key() {
        let store = InMemoryLedgerStore::new();
        let p = pair();
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    let work = UnitOfWork::new(Utc::now())
                        .movement(draft(&format!("V-{i}"), p, MovementKind::In, 1));
                    store.commit_sync(work).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    for m in store.pair_history_sync(p).unwrap() {
                        let settled = store.movement_by_key_sync(&m.movement_key).unwrap();
                        assert_eq!(settled.map(|s| s.id), Some(m.id));
                    }
                }
            });
        });

        assert_eq!(store.pair_history_sync(p).unwrap().len(), 200);
    }

    #[tokio::test]
    async fn release_without_a_row_does_not_create_one() {
        let store = InMemoryLedgerStore::new();
        let p = pair();
        let (balance, release) = store.release(p, q(3), Utc::now()).await.unwrap();
        assert!(balance.is_zero());
        assert_eq!(release.released, Quantity::ZERO);
        assert!(store.balance(p).await.unwrap().is_none());
        assert!(store.balances(&BalanceFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn movements_are_listed_newest_first() {
        let store = InMemoryLedgerStore::new();
        let p = pair();
        let t0 = Utc::now();
        for (i, offset) in [0i64, 2, 1].into_iter().enumerate() {
            let mut d = draft(&format!("R-{i}"), p, MovementKind::In, 1);
            d.effective_at = t0 + chrono::Duration::hours(offset);
            store.commit(UnitOfWork::new(t0).movement(d)).await.unwrap();
        }
        let page = store
            .movements(&MovementFilter::default(), Pagination::default())
            .await
            .unwrap();
        let keys: Vec<_> = page.items.iter().map(|m| m.movement_key.as_str()).collect();
        assert_eq!(keys, vec!["R-1", "R-2", "R-0"]);
        assert_eq!(page.total, 3);
        assert!(!page.has_more);
    }
}
