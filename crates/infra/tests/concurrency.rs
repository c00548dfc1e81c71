use std::sync::Arc;

use chrono::NaiveDate;
use stockpile_core::{Actor, AggregateRoot, Quantity, SystemClock, UserId};
use stockpile_infra::engine::{AppendMovement, FulfillmentOptions, RegisterOrderLine};
use stockpile_infra::{InMemoryLedgerStore, InventoryEngine, LedgerError, StaticMasterData};
use stockpile_inventory::{LocationId, OrderKind, OrderLineId, ProductId, StockError};
use uuid::Uuid;

struct Harness {
    engine: InventoryEngine<InMemoryLedgerStore>,
    actor: Actor,
    products: Vec<ProductId>,
    location: LocationId,
}

impl Harness {
    fn new(product_count: usize) -> Self {
        let location = LocationId::generate();
        let products: Vec<ProductId> = (0..product_count).map(|_| ProductId::generate()).collect();
        let master_data = products
            .iter()
            .enumerate()
            .fold(StaticMasterData::new(), |md, (i, p)| {
                md.with_product(*p, format!("SKU-{i:03}"))
            })
            .with_location(location, "Main");

        Self {
            engine: InventoryEngine::new(
                Arc::new(InMemoryLedgerStore::new()),
                Arc::new(master_data),
                Arc::new(SystemClock),
            ),
            actor: Actor::system(UserId::new()),
            products,
            location,
        }
    }
}

fn q(v: i64) -> Quantity {
    Quantity::from_i64(v)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_ten_of_eleven_reservations_fit() {
    let h = Harness::new(1);
    let product = h.products[0];
    h.engine
        .ledger()
        .append(&h.actor, AppendMovement::inbound("IN-100", product, h.location, q(100)))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..11)
        .map(|_| {
            let reservations = h.engine.reservations();
            let actor = h.actor.clone();
            let location = h.location;
            tokio::spawn(async move { reservations.reserve(&actor, product, location, q(10)).await })
        })
        .collect();

    let mut ok = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::Stock(StockError::InsufficientAvailable { .. })) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((ok, rejected), (10, 1));

    let b = h.engine.projector().get_balance(product, h.location).await.unwrap();
    assert_eq!(b.reserved, q(100));
    assert_eq!(b.available(), Quantity::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_appends_conserve_quantity() {
    let h = Harness::new(4);

    let mut tasks = Vec::new();
    for (p, product) in h.products.iter().copied().enumerate() {
        for i in 0..50 {
            let ledger = h.engine.ledger();
            let actor = h.actor.clone();
            let location = h.location;
            tasks.push(tokio::spawn(async move {
                let request = if i % 5 == 4 {
                    AppendMovement::outbound(format!("P{p}-{i}"), product, location, q(1))
                } else {
                    AppendMovement::inbound(format!("P{p}-{i}"), product, location, q(2))
                };
                ledger.append(&actor, request).await
            }));
        }
    }

    let mut committed = 0;
    for task in tasks {
        // An outbound may lose the race to its inbounds and be rejected.
        match task.await.unwrap() {
            Ok(_) => committed += 1,
            Err(LedgerError::Stock(StockError::InsufficientStock { .. })) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(committed >= 4 * 40);

    for product in &h.products {
        let audit = h
            .engine
            .projector()
            .audit_balance(*product, h.location)
            .await
            .unwrap();
        assert!(audit.consistent, "{audit:?}");
        assert!(audit.recorded_on_hand >= Quantity::ZERO);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_of_one_key_post_once() {
    let h = Harness::new(1);
    let product = h.products[0];

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let ledger = h.engine.ledger();
            let actor = h.actor.clone();
            let location = h.location;
            tokio::spawn(async move {
                ledger
                    .append_or_get(&actor, AppendMovement::inbound("GRN-RETRY", product, location, q(5)))
                    .await
            })
        })
        .collect();

    let mut fresh = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) if !outcome.is_replayed() => fresh += 1,
            Ok(_) => {}
            // The key is claimed by an in-flight commit; a retry resolves it.
            Err(err) if err.is_retryable() => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(fresh, 1);

    let b = h.engine.projector().get_balance(product, h.location).await.unwrap();
    assert_eq!(b.on_hand, q(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_respect_ordered_quantity() {
    let h = Harness::new(1);
    let product = h.products[0];
    h.engine
        .ledger()
        .append(&h.actor, AppendMovement::inbound("IN-1", product, h.location, q(100)))
        .await
        .unwrap();
    let line = h
        .engine
        .fulfillment()
        .register_line(
            &h.actor,
            RegisterOrderLine {
                line_id: OrderLineId::generate(),
                kind: OrderKind::Sale,
                document_id: Uuid::now_v7(),
                line_no: 1,
                product_id: product,
                location_id: h.location,
                ordered: q(25),
            },
        )
        .await
        .unwrap();

    let tasks: Vec<_> = (1..=10u32)
        .map(|seq| {
            let fulfillment = h.engine.fulfillment();
            let actor = h.actor.clone();
            let line_id = line.id;
            tokio::spawn(async move {
                fulfillment
                    .apply_delivery(&actor, line_id, q(5), FulfillmentOptions::sequence(seq))
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => applied += 1,
            Err(LedgerError::Stock(StockError::OverFulfillment { .. })) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(applied, 5);

    let line = h.engine.fulfillment().order_line(line.id).await.unwrap();
    assert_eq!(line.fulfilled, q(25));
    let b = h.engine.projector().get_balance(product, h.location).await.unwrap();
    assert_eq!(b.on_hand, q(75));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_confirmations_post_once() {
    let h = Harness::new(2);
    let adjustments = h.engine.adjustments();
    let adj = adjustments
        .create(
            &h.actor,
            h.location,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            "stock take",
        )
        .await
        .unwrap();
    for product in &h.products {
        adjustments
            .add_line(&h.actor, *adj.id(), *product, q(12))
            .await
            .unwrap();
    }

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let adjustments = h.engine.adjustments();
            let actor = h.actor.clone();
            let id = *adj.id();
            tokio::spawn(async move { adjustments.confirm(&actor, id).await })
        })
        .collect();

    let mut confirmed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(LedgerError::Stock(StockError::AlreadyConfirmed(_))) => {}
            Err(err) if err.is_retryable() => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(confirmed, 1);

    for product in &h.products {
        let b = h.engine.projector().get_balance(*product, h.location).await.unwrap();
        assert_eq!(b.on_hand, q(12));
    }
}
