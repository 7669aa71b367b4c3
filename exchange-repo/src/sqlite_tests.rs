//! SQLite repository integration tests.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use exchange_types::{
        AttachDocumentRequest, Branch, CreateBranchRequest, CreateCurrencyRequest,
        CreateOrderRequest, CreateRateRequest, CreateReviewRequest, CurrencyCode, DocumentType,
        DomainError, ExchangeRate, ExchangeRepository, Identity, NotificationStatus, Order,
        OrderId, OrderItemRequest, OrderScope, OrderStatus, RateFilter, RecordPurchaseRequest,
        RepoError, ReviewScope, Role, UpdateCurrencyRequest, UpdateProfileRequest,
        UpdateRateRequest, User,
    };
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal_macros::dec;

    use crate::SqliteRepo;
    use crate::sqlite::{swap_balance, swap_order_status};

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::parse(s).unwrap()
    }

    fn lease() -> DateTime<Utc> {
        Utc::now() + Duration::minutes(2)
    }

    async fn setup_repo() -> SqliteRepo {
        SqliteRepo::new("sqlite::memory:").await.unwrap()
    }

    /// USD, EUR and UAH, one branch and a USD -> EUR rate of 0.92 with a minimum of 10.
    async fn setup_catalog(repo: &SqliteRepo) -> (Branch, ExchangeRate) {
        for (c, name, symbol) in [("USD", "US Dollar", "$"), ("EUR", "Euro", "€"), ("UAH", "Hryvnia", "₴")] {
            repo.create_currency(CreateCurrencyRequest {
                code: code(c),
                name: name.into(),
                symbol: symbol.into(),
                decimal_places: 2,
            })
            .await
            .unwrap();
        }

        let branch = repo
            .create_branch(CreateBranchRequest {
                name: "Central".into(),
                city: "Kyiv".into(),
                address: "1 Khreshchatyk St".into(),
                phone: "+380441234567".into(),
                email: "central@example.com".into(),
                base_currency: code("UAH"),
                manager_id: None,
                working_hours: Default::default(),
            })
            .await
            .unwrap();

        let rate = repo
            .create_rate(CreateRateRequest {
                branch_id: branch.id,
                from_currency: code("USD"),
                to_currency: code("EUR"),
                rate: dec!(0.92),
                min_amount: dec!(10),
            })
            .await
            .unwrap();

        (branch, rate)
    }

    fn order_request(branch: &Branch, amounts: &[rust_decimal::Decimal]) -> CreateOrderRequest {
        CreateOrderRequest {
            branch_id: branch.id,
            client_email: "client@example.com".into(),
            client_phone: None,
            delivery_address: None,
            items: amounts
                .iter()
                .map(|amount| OrderItemRequest {
                    from_currency: code("USD"),
                    to_currency: code("EUR"),
                    from_amount: *amount,
                })
                .collect(),
        }
    }

    async fn user(repo: &SqliteRepo, email: &str) -> User {
        repo.upsert_identity(Identity {
            external_id: format!("sub-{}", email),
            email: email.into(),
        })
        .await
        .unwrap()
    }

    async fn advance(repo: &SqliteRepo, id: OrderId, statuses: &[OrderStatus]) -> Order {
        let mut order = None;
        for status in statuses {
            order = Some(repo.transition_order(id, *status, None).await.unwrap());
        }
        order.unwrap()
    }

    async fn attach(repo: &SqliteRepo, id: OrderId, doc_type: DocumentType) {
        repo.attach_document(
            id,
            AttachDocumentRequest {
                doc_type,
                file_handle: format!("uploads/{}.pdf", doc_type),
            },
            None,
        )
        .await
        .unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalog
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_and_update_currency() {
        let repo = setup_repo().await;
        setup_catalog(&repo).await;

        let updated = repo
            .update_currency(
                code("UAH"),
                UpdateCurrencyRequest {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.is_active);

        let active = repo.list_currencies(false).await.unwrap();
        assert_eq!(active.len(), 2);
        let all = repo.list_currencies(true).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_currency_rejected() {
        let repo = setup_repo().await;
        setup_catalog(&repo).await;

        let result = repo
            .create_currency(CreateCurrencyRequest {
                code: code("USD"),
                name: "Dollar again".into(),
                symbol: "$".into(),
                decimal_places: 2,
            })
            .await;

        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_update_missing_currency_not_found() {
        let repo = setup_repo().await;

        let result = repo
            .update_currency(code("XYZ"), UpdateCurrencyRequest::default())
            .await;

        assert!(matches!(result, Err(RepoError::NotFound)));
    }

    #[tokio::test]
    async fn test_branch_round_trips_working_hours() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let fetched = repo.get_branch(branch.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Central");
        assert_eq!(fetched.base_currency, code("UAH"));
        assert!(fetched.working_hours.0.is_empty());
        assert_eq!(repo.list_branches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_rate_pair_rejected() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let result = repo
            .create_rate(CreateRateRequest {
                branch_id: branch.id,
                from_currency: code("USD"),
                to_currency: code("EUR"),
                rate: dec!(0.95),
                min_amount: dec!(0),
            })
            .await;

        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_rate_for_unknown_currency_rejected() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let result = repo
            .create_rate(CreateRateRequest {
                branch_id: branch.id,
                from_currency: code("USD"),
                to_currency: code("GBP"),
                rate: dec!(0.8),
                min_amount: dec!(0),
            })
            .await;

        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_deactivated_rate_hidden_from_listing() {
        let repo = setup_repo().await;
        let (branch, rate) = setup_catalog(&repo).await;

        repo.update_rate(
            rate.id,
            UpdateRateRequest {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let visible = repo
            .list_rates(RateFilter {
                branch_id: Some(branch.id),
                include_inactive: false,
            })
            .await
            .unwrap();
        assert!(visible.is_empty());

        let all = repo
            .list_rates(RateFilter {
                branch_id: None,
                include_inactive: true,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(
            repo.find_active_rate(branch.id, code("USD"), code("EUR"))
                .await
                .unwrap()
                .is_none()
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Balances
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_record_purchase_weighted_average() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let first = repo
            .record_purchase(
                branch.id,
                RecordPurchaseRequest {
                    currency: code("USD"),
                    amount: dec!(100),
                    rate: dec!(10),
                },
            )
            .await
            .unwrap();
        assert_eq!(first.amount, dec!(100));
        assert_eq!(first.average_purchase_rate, dec!(10));

        let second = repo
            .record_purchase(
                branch.id,
                RecordPurchaseRequest {
                    currency: code("USD"),
                    amount: dec!(50),
                    rate: dec!(16),
                },
            )
            .await
            .unwrap();
        assert_eq!(second.amount, dec!(150));
        assert_eq!(second.average_purchase_rate, dec!(12));

        let balances = repo.list_balances(branch.id).await.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].id, first.id);
        assert_eq!(balances[0].average_purchase_rate, dec!(12));
    }

    #[tokio::test]
    async fn test_average_rate_stored_without_rounding() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        for (amount, rate) in [(dec!(100), dec!(10)), (dec!(30), dec!(11))] {
            repo.record_purchase(
                branch.id,
                RecordPurchaseRequest {
                    currency: code("USD"),
                    amount,
                    rate,
                },
            )
            .await
            .unwrap();
        }

        // 1330 / 130 does not terminate
        let expected = dec!(1330) / dec!(130);
        assert!(expected.scale() > 8);
        let balances = repo.list_balances(branch.id).await.unwrap();
        assert_eq!(balances[0].average_purchase_rate, expected);
    }

    #[tokio::test]
    async fn test_balance_write_with_old_version_conflicts() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        // Row is created at version 0 and bumped to 1 by the purchase
        let first = repo
            .record_purchase(
                branch.id,
                RecordPurchaseRequest {
                    currency: code("USD"),
                    amount: dec!(100),
                    rate: dec!(10),
                },
            )
            .await
            .unwrap();

        // A purchase computed against the version 0 snapshot
        let mut stale = first.clone();
        stale.amount = dec!(0);
        stale.average_purchase_rate = dec!(0);
        stale.record_purchase(dec!(50), dec!(16)).unwrap();

        let mut conn = repo.pool().acquire().await.unwrap();
        let result = swap_balance(&mut conn, &stale, 0).await;
        drop(conn);

        assert!(matches!(result, Err(RepoError::Conflict(_))));
        let balances = repo.list_balances(branch.id).await.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].amount, dec!(100));
        assert_eq!(balances[0].average_purchase_rate, dec!(10));
    }

    #[tokio::test]
    async fn test_record_purchase_rejects_non_positive_amount() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let result = repo
            .record_purchase(
                branch.id,
                RecordPurchaseRequest {
                    currency: code("USD"),
                    amount: dec!(0),
                    rate: dec!(10),
                },
            )
            .await;

        assert!(matches!(result, Err(RepoError::Domain(_))));
        // Rolled back, nothing was credited
        let balances = repo.list_balances(branch.id).await.unwrap();
        assert!(balances.iter().all(|b| b.amount == dec!(0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_order_freezes_rate() {
        let repo = setup_repo().await;
        let (branch, rate) = setup_catalog(&repo).await;

        let order = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].to_amount, dec!(92.00));
        assert_eq!(order.total_from_amount(), dec!(100));

        repo.update_rate(
            rate.id,
            UpdateRateRequest {
                rate: Some(dec!(0.99)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let fetched = repo.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(fetched.items[0].rate, dec!(0.92));
        assert_eq!(fetched.items[0].to_amount, dec!(92.00));
        assert_eq!(fetched.tracking_code, order.tracking_code);
    }

    #[tokio::test]
    async fn test_create_order_without_items_rejected() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let result = repo.create_order(None, order_request(&branch, &[])).await;

        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));
        assert!(repo.list_orders(OrderScope::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_order_below_minimum() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let result = repo
            .create_order(None, order_request(&branch, &[dec!(9.99)]))
            .await;

        match result {
            Err(RepoError::Domain(DomainError::BelowMinimum {
                amount,
                min_amount,
                currency,
            })) => {
                assert_eq!(amount, dec!(9.99));
                assert_eq!(min_amount, dec!(10));
                assert_eq!(currency, code("USD"));
            }
            other => panic!("expected BelowMinimum, got {:?}", other),
        }

        // Exactly the minimum is accepted
        repo.create_order(None, order_request(&branch, &[dec!(10)]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_order_without_rate() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let mut req = order_request(&branch, &[dec!(100)]);
        req.items[0].to_currency = code("UAH");

        let result = repo.create_order(None, req).await;

        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::RateNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_failed_item_rolls_back_whole_order() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let result = repo
            .create_order(None, order_request(&branch, &[dec!(100), dec!(1)]))
            .await;

        assert!(result.is_err());
        assert!(repo.list_orders(OrderScope::All).await.unwrap().is_empty());
        assert!(repo.claim_pending_notifications(10, lease()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tracking_codes_unique() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let mut codes = std::collections::HashSet::new();
        for _ in 0..25 {
            let order = repo
                .create_order(None, order_request(&branch, &[dec!(20)]))
                .await
                .unwrap();
            assert!(codes.insert(order.tracking_code.clone()));

            let found = repo
                .get_order_by_tracking_code(&order.tracking_code)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(found.id, order.id);
        }
    }

    #[tokio::test]
    async fn test_list_orders_scoped_to_user() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;
        let alice = user(&repo, "alice@example.com").await;
        let bob = user(&repo, "bob@example.com").await;

        repo.create_order(Some(alice.id), order_request(&branch, &[dec!(20), dec!(30)]))
            .await
            .unwrap();
        repo.create_order(Some(bob.id), order_request(&branch, &[dec!(40)]))
            .await
            .unwrap();
        repo.create_order(None, order_request(&branch, &[dec!(50)]))
            .await
            .unwrap();

        let mine = repo.list_orders(OrderScope::User(alice.id)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].items.len(), 2);
        assert_eq!(mine[0].items[0].position, 0);
        assert_eq!(mine[0].total_from_amount(), dec!(50));

        let all = repo.list_orders(OrderScope::All).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_transition_happy_path_with_documents() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;
        let operator = user(&repo, "operator@example.com").await;

        let order = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();

        let order_processing = repo
            .transition_order(order.id, OrderStatus::Processing, Some(operator.id))
            .await
            .unwrap();
        assert_eq!(order_processing.operator_id, Some(operator.id));

        advance(&repo, order.id, &[OrderStatus::WaitingDelivery]).await;

        let result = repo
            .transition_order(order.id, OrderStatus::Completed, None)
            .await;
        match result {
            Err(RepoError::Domain(DomainError::MissingRequirements { missing })) => {
                assert_eq!(missing, vec![DocumentType::Receipt, DocumentType::Chat]);
            }
            other => panic!("expected MissingRequirements, got {:?}", other),
        }

        attach(&repo, order.id, DocumentType::Receipt).await;
        let result = repo
            .transition_order(order.id, OrderStatus::Completed, None)
            .await;
        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::MissingRequirements { .. }))
        ));

        attach(&repo, order.id, DocumentType::Chat).await;
        let completed = repo
            .transition_order(order.id, OrderStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        // Operator is kept when a later move does not name one
        assert_eq!(completed.operator_id, Some(operator.id));
        assert_eq!(completed.documents.len(), 2);
    }

    #[tokio::test]
    async fn test_illegal_transition_lists_allowed() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let order = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();

        let result = repo
            .transition_order(order.id, OrderStatus::Completed, None)
            .await;
        match result {
            Err(RepoError::Domain(DomainError::InvalidTransition {
                current,
                requested,
                allowed,
            })) => {
                assert_eq!(current, OrderStatus::New);
                assert_eq!(requested, OrderStatus::Completed);
                assert_eq!(allowed, vec![OrderStatus::Processing, OrderStatus::Cancelled]);
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }

        let unchanged = repo.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;
        let order = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();

        // A second operator read the order while it was still new
        let mut stale = order.clone();
        let previous = stale.transition(OrderStatus::Cancelled).unwrap();
        assert_eq!(previous, OrderStatus::New);

        advance(&repo, order.id, &[OrderStatus::Processing]).await;

        let mut conn = repo.pool().acquire().await.unwrap();
        let result = swap_order_status(&mut conn, &stale, previous).await;
        drop(conn);

        assert!(matches!(result, Err(RepoError::Conflict(_))));
        let current = repo.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(current.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_transition_missing_order() {
        let repo = setup_repo().await;

        let result = repo
            .transition_order(OrderId::new(), OrderStatus::Processing, None)
            .await;

        assert!(matches!(result, Err(RepoError::NotFound)));
    }

    #[tokio::test]
    async fn test_duplicate_document_type_rejected() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;
        let order = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();

        attach(&repo, order.id, DocumentType::Receipt).await;
        let result = repo
            .attach_document(
                order.id,
                AttachDocumentRequest {
                    doc_type: DocumentType::Receipt,
                    file_handle: "uploads/other.pdf".into(),
                },
                None,
            )
            .await;

        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_delete_only_new_orders() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let fresh = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();
        attach(&repo, fresh.id, DocumentType::Chat).await;
        repo.delete_order(fresh.id).await.unwrap();
        assert!(repo.get_order(fresh.id).await.unwrap().is_none());

        let started = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();
        advance(&repo, started.id, &[OrderStatus::Processing]).await;
        let result = repo.delete_order(started.id).await;
        assert!(matches!(
            result,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));

        assert!(matches!(
            repo.delete_order(OrderId::new()).await,
            Err(RepoError::NotFound)
        ));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reviews
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_review_lifecycle() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;
        let client = user(&repo, "client@example.com").await;

        let order = repo
            .create_order(Some(client.id), order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();

        let review_req = CreateReviewRequest {
            order_id: order.id,
            rating: 5,
            text: "Quick and polite".into(),
        };
        let early = repo.create_review(client.id, review_req.clone()).await;
        assert!(matches!(
            early,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));

        advance(
            &repo,
            order.id,
            &[OrderStatus::Processing, OrderStatus::WaitingDelivery],
        )
        .await;
        attach(&repo, order.id, DocumentType::Receipt).await;
        attach(&repo, order.id, DocumentType::Chat).await;
        advance(&repo, order.id, &[OrderStatus::Completed]).await;

        let review = repo.create_review(client.id, review_req.clone()).await.unwrap();
        assert!(!review.is_visible);
        assert!(repo.list_reviews(ReviewScope::Public).await.unwrap().is_empty());
        assert_eq!(
            repo.list_reviews(ReviewScope::User(client.id)).await.unwrap().len(),
            1
        );

        let second = repo.create_review(client.id, review_req).await;
        assert!(matches!(
            second,
            Err(RepoError::Domain(DomainError::Validation(_)))
        ));

        let published = repo.set_review_visibility(review.id, true).await.unwrap();
        assert!(published.is_visible);
        assert_eq!(repo.list_reviews(ReviewScope::Public).await.unwrap().len(), 1);
        assert_eq!(repo.list_reviews(ReviewScope::All).await.unwrap().len(), 1);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users & referrals
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_upsert_identity_is_idempotent() {
        let repo = setup_repo().await;

        let first = user(&repo, "Alice@Example.com").await;
        assert_eq!(first.email, "alice@example.com");
        assert_eq!(first.username, "alice");
        assert_eq!(first.referral_code.len(), 8);

        let again = user(&repo, "Alice@Example.com").await;
        assert_eq!(again.id, first.id);

        // Same email under a new provider subject links to the same user
        let relinked = repo
            .upsert_identity(Identity {
                external_id: "another-subject".into(),
                email: "alice@example.com".into(),
            })
            .await
            .unwrap();
        assert_eq!(relinked.id, first.id);
        assert_eq!(relinked.external_id, "another-subject");
    }

    #[tokio::test]
    async fn test_profile_and_roles() {
        let repo = setup_repo().await;
        let alice = user(&repo, "alice@example.com").await;

        let updated = repo
            .update_profile(
                alice.id,
                UpdateProfileRequest {
                    first_name: Some("Alice".into()),
                    phone: Some("+380501234567".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.first_name.as_deref(), Some("Alice"));

        let bad_phone = repo
            .update_profile(
                alice.id,
                UpdateProfileRequest {
                    phone: Some("0501234567".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad_phone, Err(RepoError::Domain(_))));

        let roles = BTreeSet::from([Role::Operator, Role::Administrator]);
        repo.set_roles(alice.id, roles.clone()).await.unwrap();
        let fetched = repo.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(fetched.roles, roles);
        assert_eq!(fetched.phone.as_deref(), Some("+380501234567"));

        repo.set_roles(alice.id, BTreeSet::new()).await.unwrap();
        let fetched = repo.get_user(alice.id).await.unwrap().unwrap();
        assert!(fetched.roles.is_empty());
    }

    #[tokio::test]
    async fn test_referrals() {
        let repo = setup_repo().await;
        let alice = user(&repo, "alice@example.com").await;
        let bob = user(&repo, "bob@example.com").await;

        let own = repo.apply_referral(alice.id, &alice.referral_code).await;
        assert!(matches!(own, Err(RepoError::Domain(_))));

        let unknown = repo.apply_referral(bob.id, "nope0000").await;
        assert!(matches!(unknown, Err(RepoError::Domain(_))));

        let linked = repo.apply_referral(bob.id, &alice.referral_code).await.unwrap();
        assert_eq!(linked.referred_by, Some(alice.id));

        let twice = repo.apply_referral(bob.id, &alice.referral_code).await;
        assert!(twice.is_err());

        let referrals = repo.list_referrals(alice.id).await.unwrap();
        assert_eq!(referrals.len(), 1);
        assert_eq!(referrals[0].id, bob.id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notification outbox
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_notifications_written_with_order_changes() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;

        let order = repo
            .create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();
        advance(&repo, order.id, &[OrderStatus::Processing]).await;

        let claimed = repo.claim_pending_notifications(10, lease()).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].event_type, "order.created");
        assert_eq!(claimed[1].event_type, "order.status_changed");
        assert!(claimed.iter().all(|n| n.status == NotificationStatus::Processing));

        // Claimed rows are not handed out twice while the lease holds
        assert!(repo.claim_pending_notifications(10, lease()).await.unwrap().is_empty());

        let now = Utc::now();
        repo.mark_notification(claimed[0].id, NotificationStatus::Completed, None, now)
            .await
            .unwrap();
        repo.mark_notification(
            claimed[1].id,
            NotificationStatus::Pending,
            Some("HTTP 503".into()),
            now,
        )
        .await
        .unwrap();

        let retried = repo.claim_pending_notifications(10, lease()).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].id, claimed[1].id);
        assert_eq!(retried[0].attempts, 1);
        assert_eq!(retried[0].last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_retry_waits_until_due() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;
        repo.create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();

        let claimed = repo.claim_pending_notifications(10, lease()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        repo.mark_notification(
            claimed[0].id,
            NotificationStatus::Pending,
            Some("HTTP 502".into()),
            Utc::now() + Duration::minutes(5),
        )
        .await
        .unwrap();

        assert!(repo.claim_pending_notifications(10, lease()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_claim_is_handed_out_again() {
        let repo = setup_repo().await;
        let (branch, _) = setup_catalog(&repo).await;
        repo.create_order(None, order_request(&branch, &[dec!(100)]))
            .await
            .unwrap();

        let expired = Utc::now() - Duration::seconds(1);
        let first = repo.claim_pending_notifications(10, expired).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = repo.claim_pending_notifications(10, lease()).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].status, NotificationStatus::Processing);
        // Reclaiming is not a delivery attempt
        assert_eq!(second[0].attempts, 0);
    }
}
