//! Integration tests for the full ledger pipeline.
//!
//! Tests: Engine service → UnitOfWork → LedgerStore → balance / counter / header
//!
//! Verifies:
//! - Movements and their balance effects land together or not at all
//! - Idempotent replays never double-apply
//! - Adjustment confirmation is all-or-nothing
//! - Conservation: a pair's on-hand always equals the fold of its movements

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use uuid::Uuid;

    use stockpile_core::{AggregateRoot, Quantity};
    use stockpile_inventory::{BalanceKey, Confirmation, OrderKind, OrderLineId, StockError};

    use crate::engine::test_support::{Fixture, q};
    use crate::engine::{AppendMovement, FulfillmentOptions, RegisterOrderLine};
    use crate::error::LedgerError;
    use crate::store::{AdjustmentConfirmation, LedgerStore, UnitOfWork};

    #[tokio::test]
    async fn receive_ship_reserve_scenario() {
        let fx = Fixture::new();
        let ledger = fx.engine.ledger();
        let projector = fx.engine.projector();
        let reservations = fx.engine.reservations();

        ledger
            .append(&fx.actor, AppendMovement::inbound("IN-50", fx.product, fx.location, q(50)))
            .await
            .unwrap();
        let b = projector.get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!((b.on_hand, b.reserved, b.available()), (q(50), q(0), q(50)));

        ledger
            .append(&fx.actor, AppendMovement::outbound("OUT-20", fx.product, fx.location, q(20)))
            .await
            .unwrap();
        let b = projector.get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!((b.on_hand, b.reserved, b.available()), (q(30), q(0), q(30)));

        let b = reservations
            .reserve(&fx.actor, fx.product, fx.location, q(25))
            .await
            .unwrap();
        assert_eq!((b.reserved, b.available()), (q(25), q(5)));

        let err = reservations
            .reserve(&fx.actor, fx.product, fx.location, q(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Stock(StockError::InsufficientAvailable { .. })
        ));
        let b = projector.get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!((b.on_hand, b.reserved, b.available()), (q(30), q(25), q(5)));
    }

    #[tokio::test]
    async fn count_of_45_against_30_posts_plus_15() {
        let fx = Fixture::new();
        fx.engine
            .ledger()
            .append(&fx.actor, AppendMovement::inbound("IN-30", fx.product, fx.location, q(30)))
            .await
            .unwrap();

        let adjustments = fx.engine.adjustments();
        let adj = adjustments
            .create(
                &fx.actor,
                fx.location,
                NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                "annual count",
            )
            .await
            .unwrap();
        let line = adjustments
            .add_line(&fx.actor, *adj.id(), fx.product, q(45))
            .await
            .unwrap();
        assert_eq!(line.quantity_before, q(30));

        let confirmed = adjustments.confirm(&fx.actor, *adj.id()).await.unwrap();
        assert_eq!(confirmed.movements.len(), 1);
        assert_eq!(confirmed.movements[0].signed_delta(), q(15));
        assert_eq!(
            confirmed.movements[0].movement_key,
            confirmed.adjustment.movement_key(line.id)
        );

        let b = fx.engine.projector().get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!(b.on_hand, q(45));
    }

    #[tokio::test]
    async fn snapshot_is_not_re_read_at_confirmation() {
        let fx = Fixture::new();
        let ledger = fx.engine.ledger();
        ledger
            .append(&fx.actor, AppendMovement::inbound("IN-1", fx.product, fx.location, q(30)))
            .await
            .unwrap();

        let adjustments = fx.engine.adjustments();
        let adj = adjustments
            .create(
                &fx.actor,
                fx.location,
                NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                "count",
            )
            .await
            .unwrap();
        adjustments
            .add_line(&fx.actor, *adj.id(), fx.product, q(25))
            .await
            .unwrap();

        // Stock moves between count and confirmation.
        ledger
            .append(&fx.actor, AppendMovement::inbound("IN-2", fx.product, fx.location, q(10)))
            .await
            .unwrap();

        adjustments.confirm(&fx.actor, *adj.id()).await.unwrap();
        let b = fx.engine.projector().get_balance(fx.product, fx.location).await.unwrap();
        // 30 + 10 - 5
        assert_eq!(b.on_hand, q(35));
    }

    #[tokio::test]
    async fn failed_line_keeps_the_whole_adjustment_draft() {
        let fx = Fixture::new();
        let adjustments = fx.engine.adjustments();
        let adj = adjustments
            .create(
                &fx.actor,
                fx.location,
                NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(),
                "count",
            )
            .await
            .unwrap();
        adjustments
            .add_line(&fx.actor, *adj.id(), fx.product, q(7))
            .await
            .unwrap();
        let second = adjustments
            .add_line(&fx.actor, *adj.id(), fx.other_product, q(4))
            .await
            .unwrap();

        // Someone else already holds the second line's movement key.
        let adj = adjustments.get(*adj.id()).await.unwrap();
        fx.engine
            .ledger()
            .append(
                &fx.actor,
                AppendMovement::inbound(adj.movement_key(second.id), fx.other_product, fx.location, q(1)),
            )
            .await
            .unwrap();

        let err = adjustments.confirm(&fx.actor, *adj.id()).await.unwrap_err();
        assert!(err.is_duplicate());

        let after = adjustments.get(*adj.id()).await.unwrap();
        assert!(after.is_draft());
        let first_key = adj.movement_key(adj.lines()[0].id);
        assert!(fx.engine.ledger().movement_by_key(&first_key).await.unwrap().is_none());
        let b = fx.engine.projector().get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!(b.on_hand, Quantity::ZERO);
    }

    #[tokio::test]
    async fn edit_racing_a_confirmation_is_a_conflict() {
        let fx = Fixture::new();
        let adjustments = fx.engine.adjustments();
        let adj = adjustments
            .create(
                &fx.actor,
                fx.location,
                NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
                "count",
            )
            .await
            .unwrap();
        let line = adjustments
            .add_line(&fx.actor, *adj.id(), fx.product, q(5))
            .await
            .unwrap();
        let stale = adjustments.get(*adj.id()).await.unwrap();

        adjustments
            .update_line(&fx.actor, *adj.id(), line.id, q(6))
            .await
            .unwrap();

        let now = fx.clock_now();
        let work = stale
            .movement_drafts(fx.actor.user_id(), now)
            .unwrap()
            .into_iter()
            .fold(UnitOfWork::new(now), UnitOfWork::movement)
            .confirm(AdjustmentConfirmation {
                adjustment_id: *stale.id(),
                expected_version: stale.version(),
                confirmation: Confirmation {
                    confirmed_by: fx.actor.user_id(),
                    confirmed_at: now,
                },
            });
        let err = fx.engine.context().store().commit(work).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert!(err.is_retryable());
        assert!(adjustments.get(*adj.id()).await.unwrap().is_draft());
    }

    #[tokio::test]
    async fn retried_append_applies_once() {
        let fx = Fixture::new();
        let ledger = fx.engine.ledger();
        let request = AppendMovement::inbound("GRN-42", fx.product, fx.location, q(8));

        let original = ledger.append(&fx.actor, request.clone()).await.unwrap();
        let err = ledger.append(&fx.actor, request).await.unwrap_err();
        match err {
            LedgerError::DuplicateMovement { key, existing } => {
                assert_eq!(key, "GRN-42");
                assert_eq!(*existing, original);
            }
            other => panic!("expected DuplicateMovement, got {other:?}"),
        }

        let audit = fx
            .engine
            .projector()
            .audit_balance(fx.product, fx.location)
            .await
            .unwrap();
        assert_eq!(audit.recorded_on_hand, q(8));
        assert_eq!(audit.movement_count, 1);
    }

    #[tokio::test]
    async fn fulfillment_never_exceeds_ordered() {
        let fx = Fixture::new();
        let fulfillment = fx.engine.fulfillment();
        let line = fulfillment
            .register_line(
                &fx.actor,
                RegisterOrderLine {
                    line_id: OrderLineId::generate(),
                    kind: OrderKind::Purchase,
                    document_id: Uuid::now_v7(),
                    line_no: 3,
                    product_id: fx.product,
                    location_id: fx.location,
                    ordered: q(10),
                },
            )
            .await
            .unwrap();

        for (seq, qty) in [(1, 4), (2, 4), (3, 4), (4, 2)] {
            let _ = fulfillment
                .apply_receipt(&fx.actor, line.id, q(qty), FulfillmentOptions::sequence(seq))
                .await;
        }

        let line = fulfillment.order_line(line.id).await.unwrap();
        assert_eq!(line.fulfilled, q(10));
        let b = fx.engine.projector().get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!(b.on_hand, line.fulfilled);

        let err = fulfillment
            .set_ordered(&fx.actor, line.id, q(9))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn unchecked_adjustment_truncates_reservation() {
        let fx = Fixture::new();
        fx.engine
            .ledger()
            .append(&fx.actor, AppendMovement::inbound("IN-1", fx.product, fx.location, q(10)))
            .await
            .unwrap();
        fx.engine
            .reservations()
            .reserve(&fx.actor, fx.product, fx.location, q(8))
            .await
            .unwrap();

        let adjustments = fx.engine.adjustments();
        let adj = adjustments
            .create(
                &fx.actor,
                fx.location,
                NaiveDate::from_ymd_opt(2024, 6, 4).unwrap(),
                "damaged",
            )
            .await
            .unwrap();
        adjustments
            .add_line(&fx.actor, *adj.id(), fx.product, q(3))
            .await
            .unwrap();
        adjustments.confirm(&fx.actor, *adj.id()).await.unwrap();

        let b = fx.engine.projector().get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!(b.on_hand, q(3));
        assert_eq!(b.reserved, q(3));
        assert!(b.available() >= Quantity::ZERO);
    }

    #[derive(Debug, Clone)]
    enum Op {
        In(i64),
        Out(i64),
        Reserve(i64),
        Release(i64),
        Count(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..40).prop_map(Op::In),
            (1i64..40).prop_map(Op::Out),
            (1i64..40).prop_map(Op::Reserve),
            (1i64..40).prop_map(Op::Release),
            (0i64..60).prop_map(Op::Count),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn balance_always_equals_fold_of_movements(ops in proptest::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let fx = Fixture::new();
                let key = BalanceKey::new(fx.product, fx.location);
                for (i, op) in ops.into_iter().enumerate() {
                    let movement_key = format!("P-{i}");
                    let _ = match op {
                        Op::In(n) => fx.engine.ledger()
                            .append(&fx.actor, AppendMovement::inbound(movement_key, fx.product, fx.location, q(n)))
                            .await.map(|_| ()),
                        Op::Out(n) => fx.engine.ledger()
                            .append(&fx.actor, AppendMovement::outbound(movement_key, fx.product, fx.location, q(n)))
                            .await.map(|_| ()),
                        Op::Reserve(n) => fx.engine.reservations()
                            .reserve(&fx.actor, fx.product, fx.location, q(n))
                            .await.map(|_| ()),
                        Op::Release(n) => fx.engine.reservations()
                            .release(&fx.actor, fx.product, fx.location, q(n))
                            .await.map(|_| ()),
                        Op::Count(n) => {
                            let adjustments = fx.engine.adjustments();
                            let adj = adjustments
                                .create(&fx.actor, fx.location, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), "count")
                                .await
                                .unwrap();
                            adjustments.add_line(&fx.actor, *adj.id(), fx.product, q(n)).await.unwrap();
                            adjustments.confirm(&fx.actor, *adj.id()).await.map(|_| ())
                        }
                    };

                    let audit = fx.engine.projector().audit_balance(key.product_id, key.location_id).await.unwrap();
                    prop_assert!(audit.consistent);
                    let b = fx.engine.projector().get_balance(key.product_id, key.location_id).await.unwrap();
                    prop_assert!(b.reserved >= Quantity::ZERO);
                    prop_assert!(b.reserved <= b.on_hand.max(Quantity::ZERO));
                    prop_assert_eq!(b.available(), b.on_hand - b.reserved);
                }
                Ok(())
            })?;
        }
    }
}
