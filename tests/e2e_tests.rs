//! End-to-end integration tests
//!
//! These tests drive the service surface over the in-process ledger and record
//! store with a pinned clock. Each scenario:
//! 1. Registers the users and merchants it needs
//! 2. Runs the operations under test
//! 3. Checks the responses, both stores, and that every settled row has exactly
//!    one matching ledger transfer
//!
//! Coverage:
//! - Signup, top-up, merchant payment, user transfer, refund, settlement, referral
//! - Concurrent payments racing for the same coins
//! - A crash between the ledger transfer and the status flip
//! - Policy boundaries and idempotent replays

mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use chrono::{Duration, TimeZone, Utc};
    use coin_rewards_engine::config::Config;
    use coin_rewards_engine::core::events::EventOutcome;
    use coin_rewards_engine::core::ledger::AccountCreation;
    use coin_rewards_engine::core::traits::RecordStore;
    use coin_rewards_engine::service::*;
    use coin_rewards_engine::types::*;
    use rstest::rstest;
    use rust_decimal::Decimal;

    const USER: u64 = 1;
    const RESTAURANT: u64 = 100;
    const GROCERY: u64 = 101;

    /// Signed sum of a history page: credits minus debits.
    fn net(history: &FinancialHistoryResponse) -> Decimal {
        history
            .items
            .iter()
            .map(|item| match item.direction {
                Direction::Credit => item.coins,
                Direction::Debit => -item.coins,
            })
            .sum()
    }

    /// User 1 with the signup bonus and a 100.00 top-up, plus a restaurant.
    async fn funded() -> (Harness, UserId, MerchantId) {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        h.top_up(user, "100.00").await;
        let merchant = h.merchant(RESTAURANT, "Trattoria Roma", "restaurant").await;
        (h, user, merchant)
    }

    #[tokio::test]
    async fn test_signup_and_top_up() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        assert_eq!(h.balance(user).await, dec("10.00"));

        let purchase = h.top_up(user, "100.00").await;
        assert_eq!(purchase.status, PurchaseStatus::Completed);
        assert_eq!(purchase.coins_to_receive, dec("100.00"));
        assert_eq!(purchase.new_balance, dec("110.00"));

        let history = h.history(user).await;
        assert_eq!(history.items.len(), 2);
        assert!(history.items.iter().all(|i| i.direction == Direction::Credit));
        assert_eq!(net(&history), dec("110.00"));
        assert_eq!(history.current_balance, dec("110.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_register_twice_credits_bonus_once() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        let again = h
            .service()
            .register_user(RegisterUserRequest { user_id: user }, &token())
            .await
            .unwrap();

        assert!(!again.created);
        assert_eq!(again.balance, dec("10.00"));
        assert_eq!(h.store.all_intents().len(), 1);
    }

    #[tokio::test]
    async fn test_account_lifecycle_is_idempotent() {
        let h = Harness::start().await;
        let first = h
            .service()
            .register_merchant(RegisterMerchantRequest { merchant_id: MerchantId(RESTAURANT) }, &token())
            .await
            .unwrap();
        let again = h
            .service()
            .register_merchant(RegisterMerchantRequest { merchant_id: MerchantId(RESTAURANT) }, &token())
            .await
            .unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(h.merchant_balance(MerchantId(RESTAURANT)).await, dec("0.00"));

        let coordinator = &h.engine.coordinator;
        assert_eq!(
            coordinator.register_admin(AdminId(9)).await.unwrap(),
            AccountCreation::Created
        );
        assert_eq!(
            coordinator.register_admin(AdminId(9)).await.unwrap(),
            AccountCreation::AlreadyExists
        );
        // system accounts survive a second bootstrap
        coordinator.bootstrap().await.unwrap();
        assert!(h.ledger.accounts().iter().any(|a| a.id == AccountId::SYSTEM));
        assert!(h.ledger.accounts().iter().any(|a| a.id == AccountId::SETTLEMENT));
    }

    #[tokio::test]
    async fn test_pay_restaurant() {
        let (h, user, merchant) = funded().await;

        let paid = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &token())
            .await
            .unwrap();

        assert!(paid.success);
        assert_eq!(paid.discount_amount, dec("15.00"));
        assert_eq!(paid.final_amount, dec("15.00"));
        assert_eq!(paid.remaining_balance, dec("95.00"));
        assert_eq!(h.balance(user).await, dec("95.00"));
        assert_eq!(h.merchant_balance(merchant).await, dec("15.00"));

        let tx = h.store.get_transaction(paid.transaction_id).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.kind, TransactionKind::MerchantPayment);

        let payments: Vec<_> = h
            .ledger
            .transfers()
            .into_iter()
            .filter(|t| t.op == OpCode::MerchantPayment)
            .collect();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].debit_account, AccountId::for_user(user));
        assert_eq!(payments[0].credit_account, AccountId::for_merchant(merchant));
        assert_eq!(payments[0].amount, Coins::from_whole(15));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_concurrent_payments_race_for_last_coins() {
        let mut config = Config::default();
        config.policy.signup_bonus = dec("0");
        config.policy.min_post_payment_balance = dec("0");
        let h = Harness::with_config(config).await;
        let user = h.register(USER, "Ana").await;
        h.top_up(user, "1.20").await;
        let merchant = h.merchant(RESTAURANT, "Trattoria Roma", "restaurant").await;

        // both payments pass their checks before either posts
        h.gate_payments(2);
        let cancel = token();
        let (first, second) = tokio::join!(
            h.service()
                .pay_to_merchant(h.pay_request(user, merchant, "6.00"), &cancel),
            h.service()
                .pay_to_merchant(h.pay_request(user, merchant, "6.00"), &cancel),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EngineError::InsufficientFunds { .. }))));
        assert_eq!(h.balance(user).await, dec("0.30"));

        let statuses: Vec<RecordStatus> = h
            .store
            .all_intents()
            .iter()
            .filter(|i| matches!(i, Intent::Transaction(_)))
            .map(|i| i.status())
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.contains(&RecordStatus::Transaction(TransactionStatus::Completed)));
        assert!(statuses.contains(&RecordStatus::Transaction(TransactionStatus::Failed)));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_transfer_enriches_both_histories() {
        let h = Harness::start().await;
        let ana = h.register(1, "Ana").await;
        let ben = h.register(2, "Ben").await;
        h.top_up(ana, "500.00").await;
        assert_eq!(h.balance(ana).await, dec("510.00"));

        let sent = h
            .service()
            .transfer_to_user(
                TransferToUserRequest {
                    from_user_id: ana,
                    to_user_id: ben,
                    amount: dec("100.00"),
                    description: Some("dinner".to_string()),
                    idempotency_key: None,
                },
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(sent.remaining_balance, dec("410.00"));
        assert_eq!(h.balance(ben).await, dec("110.00"));

        let history = h.history(ana).await;
        let debit = history
            .items
            .iter()
            .find(|i| i.direction == Direction::Debit)
            .unwrap();
        assert_eq!(debit.coins, dec("100.00"));
        let counterparty = debit.counterparty.as_ref().unwrap();
        assert_eq!(counterparty.id, ben.0);
        assert_eq!(counterparty.name.as_deref(), Some("Ben"));
        assert_eq!(counterparty.email.as_deref(), Some("ben@example.com"));
        assert_eq!(net(&history), dec("410.00"));

        let history = h.history(ben).await;
        let credit = history
            .items
            .iter()
            .find(|i| i.id == sent.transaction_id)
            .unwrap();
        assert_eq!(credit.direction, Direction::Credit);
        assert_eq!(credit.coins, dec("100.00"));
        assert_eq!(credit.counterparty.as_ref().unwrap().name.as_deref(), Some("Ana"));
        assert_eq!(net(&history), dec("110.00"));
    }

    #[tokio::test]
    async fn test_refund_merchant_payment() {
        let (h, user, merchant) = funded().await;
        let paid = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &token())
            .await
            .unwrap();

        let refund = h
            .service()
            .refund_payment(
                RefundPaymentRequest {
                    payment_id: paid.transaction_id,
                    amount: Some(dec("15.00")),
                    idempotency_key: None,
                },
                &token(),
            )
            .await
            .unwrap();

        assert!(refund.success);
        assert_eq!(refund.amount, dec("15.00"));
        assert_eq!(h.balance(user).await, dec("110.00"));
        assert_eq!(h.merchant_balance(merchant).await, dec("0.00"));

        let original = h.store.get_transaction(paid.transaction_id).await.unwrap();
        assert_eq!(original.status, TransactionStatus::Reversed);
        let refund_row = h.store.get_transaction(refund.refund_id).await.unwrap();
        assert_eq!(refund_row.status, TransactionStatus::Completed);
        assert_eq!(refund_row.refund_of, Some(paid.transaction_id));

        assert_eq!(net(&h.history(user).await), dec("110.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_partial_refunds_accumulate() {
        let (h, user, merchant) = funded().await;
        let paid = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &token())
            .await
            .unwrap();
        let refund = |amount: Option<Decimal>| RefundPaymentRequest {
            payment_id: paid.transaction_id,
            amount,
            idempotency_key: None,
        };

        h.service()
            .refund_payment(refund(Some(dec("5.00"))), &token())
            .await
            .unwrap();
        let original = h.store.get_transaction(paid.transaction_id).await.unwrap();
        assert_eq!(original.status, TransactionStatus::PartiallyReversed);

        let rest = h.service().refund_payment(refund(None), &token()).await.unwrap();
        assert_eq!(rest.amount, dec("10.00"));
        let original = h.store.get_transaction(paid.transaction_id).await.unwrap();
        assert_eq!(original.status, TransactionStatus::Reversed);
        assert_eq!(h.balance(user).await, dec("110.00"));

        let err = h
            .service()
            .refund_payment(refund(Some(dec("1.00"))), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_refund_coin_purchase() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        let purchase = h.top_up(user, "100.00").await;

        let refund = h
            .service()
            .refund_payment(
                RefundPaymentRequest {
                    payment_id: purchase.payment_id,
                    amount: None,
                    idempotency_key: None,
                },
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(refund.amount, dec("100.00"));
        assert_eq!(h.balance(user).await, dec("10.00"));

        let purchase = h.store.get_purchase(purchase.payment_id).await.unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Refunded);
        assert_eq!(net(&h.history(user).await), dec("10.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_crash_after_transfer_is_completed_by_reconciler() {
        let (h, user, merchant) = funded().await;

        h.fail_next_commit();
        let err = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &token())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let pending: Vec<Intent> = h
            .store
            .all_intents()
            .into_iter()
            .filter(|i| i.is_pending())
            .collect();
        assert_eq!(pending.len(), 1);
        let tx_id = pending[0].id();
        assert!(h.ledger.transfers().iter().any(|t| t.id == pending[0].transfer_id()));
        assert_eq!(h.balance(user).await, dec("95.00"));

        h.clock.advance(Duration::seconds(31));
        let report = h.engine.reconciler.run_once().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.inconsistent, 0);

        let tx = h.store.get_transaction(tx_id).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(h.balance(user).await, dec("95.00"));
        assert_eq!(h.merchant_balance(merchant).await, dec("15.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_retry_with_key_resumes_pending_intent() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        let request = || InitiateCoinPurchaseRequest {
            user_id: user,
            amount: dec("50.00"),
            payment_method: "stripe".to_string(),
            external_payment_id: Some("pi_123".to_string()),
            idempotency_key: Some("order-7".to_string()),
        };

        h.fail_next_commit();
        let err = h
            .service()
            .initiate_coin_purchase(request(), &token())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let retried = h
            .service()
            .initiate_coin_purchase(request(), &token())
            .await
            .unwrap();
        assert_eq!(retried.status, PurchaseStatus::Completed);
        assert_eq!(retried.new_balance, dec("60.00"));
        assert_eq!(h.ledger.transfers().len(), 2);
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_verify_payment_resumes_pending_purchase() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;

        h.fail_next_commit();
        h.service()
            .initiate_coin_purchase(
                InitiateCoinPurchaseRequest {
                    user_id: user,
                    amount: dec("25.00"),
                    payment_method: "card".to_string(),
                    external_payment_id: None,
                    idempotency_key: None,
                },
                &token(),
            )
            .await
            .unwrap_err();
        let pending = h
            .store
            .all_intents()
            .into_iter()
            .find(|i| i.is_pending())
            .unwrap();

        let verified = h
            .service()
            .verify_payment(VerifyPaymentRequest { payment_id: pending.id() }, &token())
            .await
            .unwrap();
        assert!(verified.success);
        assert_eq!(verified.status, PurchaseStatus::Completed);
        assert_eq!(verified.coins_added, dec("25.00"));
        assert_eq!(verified.new_balance, dec("35.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_duplicate_requests_apply_once() {
        let (h, user, merchant) = funded().await;
        let top_up = InitiateCoinPurchaseRequest {
            user_id: user,
            amount: dec("20.00"),
            payment_method: "stripe".to_string(),
            external_payment_id: None,
            idempotency_key: Some("top-up-1".to_string()),
        };
        let first = h
            .service()
            .initiate_coin_purchase(top_up.clone(), &token())
            .await
            .unwrap();
        let second = h
            .service()
            .initiate_coin_purchase(top_up, &token())
            .await
            .unwrap();
        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(h.balance(user).await, dec("130.00"));

        let mut pay = h.pay_request(user, merchant, "20.00");
        pay.idempotency_key = Some("bill-9".to_string());
        let first = h.service().pay_to_merchant(pay.clone(), &token()).await.unwrap();
        let second = h.service().pay_to_merchant(pay, &token()).await.unwrap();
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(h.balance(user).await, dec("127.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_cancelled_request_writes_nothing() {
        let (h, user, merchant) = funded().await;
        let rows = h.store.all_intents().len();
        let transfers = h.ledger.transfers().len();

        let cancel = token();
        cancel.cancel();
        let err = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "10.00"), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, EngineError::Cancelled);
        assert_eq!(h.store.all_intents().len(), rows);
        assert_eq!(h.ledger.transfers().len(), transfers);
    }

    #[tokio::test]
    async fn test_cancellation_after_transfer_still_completes() {
        let (h, user, merchant) = funded().await;
        let cancel = token();
        h.cancel_after_post(cancel.clone());

        let paid = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &cancel)
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        let tx = h.store.get_transaction(paid.transaction_id).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(h.balance(user).await, dec("95.00"));
        assert!(h.store.all_intents().iter().all(|i| !i.is_pending()));
        h.assert_no_phantom_value();
    }

    #[rstest]
    #[case::ledger_unreachable(LedgerError::Unavailable("connection reset".to_string()), true)]
    #[case::malformed_transfer(LedgerError::InvalidTransfer("posted totals overflow".to_string()), false)]
    #[tokio::test]
    async fn test_ledger_error_rolls_back_intent(#[case] fault: LedgerError, #[case] retryable: bool) {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        let rows = h.store.all_intents().len();

        h.fail_next_post(fault);
        let err = h
            .service()
            .initiate_coin_purchase(
                InitiateCoinPurchaseRequest {
                    user_id: user,
                    amount: dec("50.00"),
                    payment_method: "stripe".to_string(),
                    external_payment_id: None,
                    idempotency_key: Some("top-up-7".to_string()),
                },
                &token(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.is_retryable(), retryable);
        if retryable {
            assert!(matches!(err, EngineError::TransientFailure(_)));
        } else {
            assert!(matches!(err, EngineError::InvalidInput(_)));
        }
        // the pending row and its key are gone
        assert_eq!(h.store.all_intents().len(), rows);
        assert!(h
            .store
            .find_by_idempotency_key("topup:top-up-7")
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.balance(user).await, dec("10.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_closed_ledger_leaves_no_row() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        h.ledger.close();

        let err = h
            .service()
            .initiate_coin_purchase(
                InitiateCoinPurchaseRequest {
                    user_id: user,
                    amount: dec("50.00"),
                    payment_method: "stripe".to_string(),
                    external_payment_id: None,
                    idempotency_key: None,
                },
                &token(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::TransientFailure(_)));
        // only the signup bonus
        assert_eq!(h.store.all_intents().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_request_does_not_claim_its_key() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        let merchant = h.merchant(RESTAURANT, "Trattoria Roma", "restaurant").await;
        let mut dinner = h.pay_request(user, merchant, "100.00");
        dinner.idempotency_key = Some("dinner".to_string());

        let err = h
            .service()
            .pay_to_merchant(dinner.clone(), &token())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::PolicyRejected(PolicyViolation::InsufficientBalance));
        assert!(h.store.find_by_idempotency_key("pay:dinner").await.unwrap().is_none());

        // the same key is a fresh request once the balance covers it
        h.top_up(user, "20.00").await;
        let paid = h.service().pay_to_merchant(dinner.clone(), &token()).await.unwrap();
        assert_eq!(paid.remaining_balance, dec("15.00"));
        let again = h.service().pay_to_merchant(dinner, &token()).await.unwrap();
        assert_eq!(again.transaction_id, paid.transaction_id);
        assert_eq!(h.balance(user).await, dec("15.00"));

        let payments = h
            .ledger
            .transfers()
            .into_iter()
            .filter(|t| t.op == OpCode::MerchantPayment)
            .count();
        assert_eq!(payments, 1);
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_reused_key_with_different_request_is_rejected() {
        let (h, user, merchant) = funded().await;
        let mut bill = h.pay_request(user, merchant, "20.00");
        bill.idempotency_key = Some("bill-1".to_string());
        h.service().pay_to_merchant(bill.clone(), &token()).await.unwrap();
        let transfers = h.ledger.transfers().len();

        bill.amount = dec("40.00");
        let err = h.service().pay_to_merchant(bill, &token()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let other = h.register(2, "Ben").await;
        let mut bill = h.pay_request(other, merchant, "20.00");
        bill.idempotency_key = Some("bill-1".to_string());
        let err = h.service().pay_to_merchant(bill, &token()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        // keys are scoped per operation, so this is a new top-up
        let topped = h
            .service()
            .initiate_coin_purchase(
                InitiateCoinPurchaseRequest {
                    user_id: user,
                    amount: dec("20.00"),
                    payment_method: "stripe".to_string(),
                    external_payment_id: None,
                    idempotency_key: Some("bill-1".to_string()),
                },
                &token(),
            )
            .await;
        assert!(topped.is_ok());

        assert_eq!(h.ledger.transfers().len(), transfers + 2);
        assert_eq!(h.balance(user).await, dec("127.00"));
    }

    #[tokio::test]
    async fn test_amounts_round_half_to_even_on_entry() {
        let (h, user, merchant) = funded().await;

        let topped = h.top_up(user, "20.125").await;
        assert_eq!(topped.coins_to_receive, dec("20.12"));
        assert_eq!(topped.new_balance, dec("130.12"));

        let paid = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.005"), &token())
            .await
            .unwrap();
        assert_eq!(paid.final_amount, dec("15.00"));
        let tx = h.store.get_transaction(paid.transaction_id).await.unwrap();
        assert_eq!(tx.original_amount, Coins::from_whole(100));
        assert_eq!(h.balance(user).await, dec("115.12"));
    }

    #[rstest]
    #[case::below_min_purchase(RESTAURANT, "0.99", 12, Some(PolicyViolation::MinPurchase))]
    #[case::reserve_exactly_met(GROCERY, "450.00", 12, None)]
    #[case::reserve_short_by_a_cent(GROCERY, "450.50", 12, Some(PolicyViolation::BelowMinimumReserve))]
    #[case::grocery_at_night(GROCERY, "50.00", 2, None)]
    #[case::restaurant_at_night(RESTAURANT, "10.00", 2, Some(PolicyViolation::OutsideBusinessHours))]
    #[case::restaurant_opens(RESTAURANT, "10.00", 6, None)]
    #[case::restaurant_last_hour(RESTAURANT, "10.00", 23, None)]
    #[tokio::test]
    async fn test_payment_gates(
        #[case] merchant: u64,
        #[case] amount: &str,
        #[case] hour: u32,
        #[case] violation: Option<PolicyViolation>,
    ) {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        h.merchant(RESTAURANT, "Trattoria Roma", "restaurant").await;
        h.merchant(GROCERY, "Fresh Corner", "grocery").await;
        h.clock
            .set(Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap());

        let result = h
            .service()
            .pay_to_merchant(h.pay_request(user, MerchantId(merchant), amount), &token())
            .await;

        match violation {
            Some(violation) => {
                assert_eq!(result.unwrap_err(), EngineError::PolicyRejected(violation));
                assert_eq!(h.balance(user).await, dec("10.00"));
                // only the signup bonus row exists
                assert_eq!(h.store.all_intents().len(), 1);
            }
            None => {
                let paid = result.unwrap();
                assert!(paid.remaining_balance >= dec("1.00"));
            }
        }
    }

    #[tokio::test]
    async fn test_daily_limit() {
        let (h, user, merchant) = funded().await;
        h.top_up(user, "1000.00").await;

        h.service()
            .pay_to_merchant(h.pay_request(user, merchant, "600.00"), &token())
            .await
            .unwrap();
        let err = h
            .service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &token())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::PolicyRejected(PolicyViolation::DailyLimitExceeded));

        // the window rolls after 24 hours
        h.clock.advance(Duration::hours(24) + Duration::seconds(1));
        h.service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &token())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_merchant_and_category() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        h.merchant(200, "Book Nook", "bookstore").await;

        let err = h
            .service()
            .pay_to_merchant(h.pay_request(user, MerchantId(999), "10.00"), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = h
            .service()
            .pay_to_merchant(h.pay_request(user, MerchantId(200), "10.00"), &token())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::PolicyRejected(PolicyViolation::UnknownCategory));
    }

    #[tokio::test]
    async fn test_transfer_rejections() {
        let h = Harness::start().await;
        let ana = h.register(1, "Ana").await;
        let ben = h.register(2, "Ben").await;
        let transfer = |to: UserId, amount: &str| TransferToUserRequest {
            from_user_id: ana,
            to_user_id: to,
            amount: dec(amount),
            description: None,
            idempotency_key: None,
        };

        let err = h
            .service()
            .transfer_to_user(transfer(ana, "1.00"), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = h
            .service()
            .transfer_to_user(transfer(ben, "20.00"), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        let err = h
            .service()
            .transfer_to_user(transfer(UserId(77), "1.00"), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        assert_eq!(h.balance(ana).await, dec("10.00"));
        assert_eq!(h.store.all_intents().len(), 2);
    }

    #[tokio::test]
    async fn test_top_up_below_minimum() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        let err = h
            .service()
            .initiate_coin_purchase(
                InitiateCoinPurchaseRequest {
                    user_id: user,
                    amount: dec("0.99"),
                    payment_method: "stripe".to_string(),
                    external_payment_id: None,
                    idempotency_key: None,
                },
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::PolicyRejected(PolicyViolation::MinPurchase));
        assert_eq!(h.balance(user).await, dec("10.00"));
    }

    #[tokio::test]
    async fn test_settlement_drains_merchant() {
        let (h, user, merchant) = funded().await;
        h.service()
            .pay_to_merchant(h.pay_request(user, merchant, "100.00"), &token())
            .await
            .unwrap();

        let settle = |amount: &str| InitiateSettlementRequest {
            merchant_id: merchant,
            amount: dec(amount),
            period_start: noon() - Duration::days(7),
            period_end: noon(),
            idempotency_key: None,
        };
        let settled = h
            .service()
            .initiate_settlement(settle("15.00"), &token())
            .await
            .unwrap();
        assert!(settled.success);
        assert_eq!(settled.status, SettlementStatus::Completed);
        assert_eq!(h.merchant_balance(merchant).await, dec("0.00"));

        let err = h
            .service()
            .initiate_settlement(settle("1.00"), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        let listed = h
            .service()
            .get_settlements(
                GetSettlementsRequest {
                    merchant_id: merchant,
                    page: 1,
                    limit: 20,
                },
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(listed.total_count, 2);
        assert_eq!(listed.settlements[0].status, SettlementStatus::Failed);
        assert_eq!(listed.settlements[1].status, SettlementStatus::Completed);
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_referral_pays_once() {
        let h = Harness::start().await;
        let ana = h.register(1, "Ana").await;
        let ben = h.register(2, "Ben").await;
        let grant = || GrantReferralRequest {
            referrer_id: ana,
            referred_id: ben,
            idempotency_key: None,
        };

        let first = h
            .service()
            .grant_referral_rewards(grant(), &token())
            .await
            .unwrap();
        assert_eq!(first.rewards.len(), 2);
        assert!(first.rewards.iter().all(|r| r.status == RewardStatus::Credited));
        assert_eq!(h.balance(ana).await, dec("15.00"));
        assert_eq!(h.balance(ben).await, dec("20.00"));

        let second = h
            .service()
            .grant_referral_rewards(grant(), &token())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.balance(ana).await, dec("15.00"));

        let history = h.history(ben).await;
        let reward = history
            .items
            .iter()
            .find(|i| matches!(i.entry, HistoryEntry::ReferralReward { .. }))
            .unwrap();
        assert_eq!(reward.counterparty.as_ref().unwrap().id, ana.0);
        assert_eq!(net(&history), dec("20.00"));
        h.assert_no_phantom_value();
    }

    #[tokio::test]
    async fn test_completed_operations_publish_events() {
        let h = Harness::start().await;
        let user = h.register(USER, "Ana").await;
        let mut events = h.engine.events.subscribe();

        let purchase = h.top_up(user, "40.00").await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.record_id, purchase.payment_id);
        assert_eq!(event.op, OpCode::TopUp);
        assert_eq!(event.credit, AccountId::for_user(user));
        assert_eq!(event.amount, Coins::from_whole(40));
        assert_eq!(event.outcome, EventOutcome::Completed);
    }

    #[tokio::test]
    async fn test_history_pages_and_filters() {
        let (h, user, merchant) = funded().await;
        for _ in 0..3 {
            h.service()
                .pay_to_merchant(h.pay_request(user, merchant, "10.00"), &token())
                .await
                .unwrap();
            h.clock.advance(Duration::minutes(1));
        }
        let query = |page: u32, limit: u32, filter: HistoryFilter| FinancialHistoryRequest {
            user_id: user,
            page,
            limit,
            filter,
        };

        let debits = h
            .service()
            .get_financial_history(query(1, 20, HistoryFilter::Debit), &token())
            .await
            .unwrap();
        assert_eq!(debits.total_count, 3);
        assert!(debits.items.iter().all(|i| i.direction == Direction::Debit));

        let page = h
            .service()
            .get_financial_history(query(2, 2, HistoryFilter::All), &token())
            .await
            .unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.current_balance, dec("105.50"));
        assert!(page.items[0].timestamp >= page.items[1].timestamp);

        let err = h
            .service()
            .get_financial_history(query(0, 20, HistoryFilter::All), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
