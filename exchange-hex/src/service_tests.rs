//! ExchangeService tests over an in-memory SQLite repository.

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use exchange_repo::SqliteRepo;
    use exchange_types::{
        Actor, AppError, ApplyReferralRequest, AttachDocumentRequest, Branch,
        CreateBranchRequest, CreateCurrencyRequest, CreateOrderRequest, CreateRateRequest,
        CreateReviewRequest, CurrencyCode, CurrencyFilter, DocumentType, DomainError,
        ExchangeRate, ExchangeRepository, Identity, OrderItemRequest, OrderResponse, OrderStatus,
        QuoteRequest, RateFilter, RecordPurchaseRequest, Role, SetRolesRequest,
        UpdateOrderStatusRequest, UpdateRateRequest, UpdateReviewRequest,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::ExchangeService;

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::parse(s).unwrap()
    }

    /// A service over a fresh database plus one actor per role.
    struct Fixture {
        service: ExchangeService<SqliteRepo>,
        owner: Actor,
        admin: Actor,
        operator: Actor,
        client: Actor,
        other_client: Actor,
        branch: Branch,
        rate: ExchangeRate,
    }

    async fn actor(service: &ExchangeService<SqliteRepo>, email: &str, roles: &[Role]) -> Actor {
        let actor = service
            .identify(Identity {
                external_id: format!("sub-{}", email),
                email: email.into(),
            })
            .await
            .unwrap();
        if roles.is_empty() {
            return actor;
        }
        let user = service
            .repo()
            .set_roles(actor.user_id.unwrap(), roles.iter().copied().collect())
            .await
            .unwrap();
        Actor::from(&user)
    }

    /// USD (2 dp) and EUR (2 dp), one branch and a USD -> EUR rate of 0.915 with a minimum of 10.
    async fn setup() -> Fixture {
        let repo = SqliteRepo::new("sqlite::memory:").await.unwrap();
        let service = ExchangeService::new(Arc::new(repo));

        let owner = actor(&service, "owner@example.com", &[Role::Owner]).await;
        let admin = actor(&service, "admin@example.com", &[Role::Administrator]).await;
        let operator = actor(&service, "operator@example.com", &[Role::Operator]).await;
        let client = actor(&service, "client@example.com", &[]).await;
        let other_client = actor(&service, "other@example.com", &[]).await;

        for (c, name, symbol) in [("USD", "US Dollar", "$"), ("EUR", "Euro", "€"), ("UAH", "Hryvnia", "₴")] {
            service
                .create_currency(
                    &admin,
                    CreateCurrencyRequest {
                        code: code(c),
                        name: name.into(),
                        symbol: symbol.into(),
                        decimal_places: 2,
                    },
                )
                .await
                .unwrap();
        }

        let branch = service
            .create_branch(
                &owner,
                CreateBranchRequest {
                    name: "Central".into(),
                    city: "Kyiv".into(),
                    address: "1 Khreshchatyk St".into(),
                    phone: "+380441234567".into(),
                    email: "central@example.com".into(),
                    base_currency: code("UAH"),
                    manager_id: None,
                    working_hours: Default::default(),
                },
            )
            .await
            .unwrap();

        let rate = service
            .create_rate(
                &admin,
                CreateRateRequest {
                    branch_id: branch.id,
                    from_currency: code("USD"),
                    to_currency: code("EUR"),
                    rate: dec!(0.915),
                    min_amount: dec!(10),
                },
            )
            .await
            .unwrap();

        Fixture {
            service,
            owner,
            admin,
            operator,
            client,
            other_client,
            branch,
            rate,
        }
    }

    fn order_request(branch: &Branch, amount: Decimal) -> CreateOrderRequest {
        CreateOrderRequest {
            branch_id: branch.id,
            client_email: "client@example.com".into(),
            client_phone: Some("+380501234567".into()),
            delivery_address: None,
            items: vec![OrderItemRequest {
                from_currency: code("USD"),
                to_currency: code("EUR"),
                from_amount: amount,
            }],
        }
    }

    async fn move_to(fx: &Fixture, order: &OrderResponse, status: OrderStatus) -> Result<OrderResponse, AppError> {
        fx.service
            .update_order_status(&fx.operator, order.id, UpdateOrderStatusRequest { status })
            .await
    }

    async fn attach(fx: &Fixture, actor: &Actor, order: &OrderResponse, doc_type: DocumentType) {
        fx.service
            .attach_document(
                actor,
                order.id,
                AttachDocumentRequest {
                    doc_type,
                    file_handle: format!("uploads/{}.pdf", doc_type),
                },
            )
            .await
            .unwrap();
    }

    async fn completed_order(fx: &Fixture) -> OrderResponse {
        let order = fx
            .service
            .create_order(&fx.client, order_request(&fx.branch, dec!(100)))
            .await
            .unwrap();
        attach(fx, &fx.client, &order, DocumentType::Receipt).await;
        attach(fx, &fx.operator, &order, DocumentType::Chat).await;
        for status in [
            OrderStatus::Processing,
            OrderStatus::WaitingDelivery,
            OrderStatus::Completed,
        ] {
            move_to(fx, &order, status).await.unwrap();
        }
        order
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Quotes
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_quote_in_both_directions_for_anonymous() {
        let fx = setup().await;
        let anon = Actor::anonymous();

        let forward = fx
            .service
            .quote(
                &anon,
                fx.rate.id,
                QuoteRequest {
                    amount_from: Some(dec!(10.01)),
                    amount_to: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(forward.amount_from, dec!(10.01));
        assert_eq!(forward.amount_to, dec!(9.16));
        assert_eq!(forward.rate, dec!(0.915));

        let backward = fx
            .service
            .quote(
                &anon,
                fx.rate.id,
                QuoteRequest {
                    amount_from: None,
                    amount_to: Some(dec!(100)),
                },
            )
            .await
            .unwrap();
        assert_eq!(backward.amount_from, dec!(109.29));
        assert_eq!(backward.amount_to, dec!(100));
    }

    #[tokio::test]
    async fn test_quote_rounds_ties_up() {
        let fx = setup().await;
        let conversion = fx
            .service
            .quote(
                &Actor::anonymous(),
                fx.rate.id,
                QuoteRequest {
                    amount_from: Some(dec!(11)),
                    amount_to: None,
                },
            )
            .await
            .unwrap();
        // 11 * 0.915 = 10.065
        assert_eq!(conversion.amount_to, dec!(10.07));
    }

    #[tokio::test]
    async fn test_quote_rejections() {
        let fx = setup().await;
        let anon = Actor::anonymous();

        let both = fx
            .service
            .quote(
                &anon,
                fx.rate.id,
                QuoteRequest {
                    amount_from: Some(dec!(100)),
                    amount_to: Some(dec!(92)),
                },
            )
            .await;
        assert!(matches!(both, Err(AppError::Domain(DomainError::InvalidInput(_)))));

        let neither = fx
            .service
            .quote(&anon, fx.rate.id, QuoteRequest::default())
            .await;
        assert!(matches!(neither, Err(AppError::Domain(DomainError::InvalidInput(_)))));

        let small = fx
            .service
            .quote(
                &anon,
                fx.rate.id,
                QuoteRequest {
                    amount_from: Some(dec!(9.99)),
                    amount_to: None,
                },
            )
            .await;
        match small {
            Err(AppError::Domain(DomainError::BelowMinimum {
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
    }

    #[tokio::test]
    async fn test_inactive_rate_is_hidden_from_the_public() {
        let fx = setup().await;
        fx.service
            .update_rate(
                &fx.admin,
                fx.rate.id,
                UpdateRateRequest {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let quote = fx
            .service
            .quote(
                &Actor::anonymous(),
                fx.rate.id,
                QuoteRequest {
                    amount_from: Some(dec!(100)),
                    amount_to: None,
                },
            )
            .await;
        assert!(matches!(quote, Err(AppError::Domain(DomainError::RateNotFound { .. }))));

        assert!(matches!(
            fx.service.get_rate(&fx.client, fx.rate.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(!fx.service.get_rate(&fx.admin, fx.rate.id).await.unwrap().is_active);

        let public = fx
            .service
            .list_rates(&Actor::anonymous(), RateFilter::default())
            .await
            .unwrap();
        assert!(public.is_empty());

        let all = RateFilter {
            branch_id: Some(fx.branch.id),
            include_inactive: true,
        };
        assert!(matches!(
            fx.service.list_rates(&fx.client, all.clone()).await,
            Err(AppError::Forbidden(_))
        ));
        assert_eq!(fx.service.list_rates(&fx.admin, all).await.unwrap().len(), 1);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalog & Balances
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_catalog_management_requires_roles() {
        let fx = setup().await;
        let req = CreateCurrencyRequest {
            code: code("GBP"),
            name: "Pound Sterling".into(),
            symbol: "£".into(),
            decimal_places: 2,
        };

        assert!(matches!(
            fx.service.create_currency(&Actor::anonymous(), req.clone()).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            fx.service.create_currency(&fx.operator, req.clone()).await,
            Err(AppError::Forbidden(_))
        ));
        fx.service.create_currency(&fx.owner, req).await.unwrap();

        assert!(matches!(
            fx.service
                .list_currencies(&fx.client, CurrencyFilter { include_inactive: true })
                .await,
            Err(AppError::Forbidden(_))
        ));
        let public = fx
            .service
            .list_currencies(&Actor::anonymous(), CurrencyFilter::default())
            .await
            .unwrap();
        assert_eq!(public.len(), 4);
    }

    #[tokio::test]
    async fn test_balances_are_owner_only() {
        let fx = setup().await;
        let purchase = |amount, rate| RecordPurchaseRequest {
            currency: code("USD"),
            amount,
            rate,
        };

        assert!(matches!(
            fx.service
                .record_purchase(&fx.admin, fx.branch.id, purchase(dec!(100), dec!(10)))
                .await,
            Err(AppError::Forbidden(_))
        ));

        fx.service
            .record_purchase(&fx.owner, fx.branch.id, purchase(dec!(100), dec!(10)))
            .await
            .unwrap();
        let balance = fx
            .service
            .record_purchase(&fx.owner, fx.branch.id, purchase(dec!(50), dec!(16)))
            .await
            .unwrap();
        assert_eq!(balance.amount, dec!(150));
        assert_eq!(balance.average_purchase_rate, dec!(12));

        assert!(matches!(
            fx.service
                .record_purchase(&fx.owner, fx.branch.id, purchase(dec!(0), dec!(16)))
                .await,
            Err(AppError::Domain(DomainError::InvalidInput(_)))
        ));

        let balances = fx
            .service
            .list_balances(&fx.owner, fx.branch.id)
            .await
            .unwrap();
        assert_eq!(balances.len(), 1);
        assert!(fx.service.list_balances(&fx.operator, fx.branch.id).await.is_err());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_order_totals_match_rounded_items() {
        let fx = setup().await;
        let mut req = order_request(&fx.branch, dec!(10.05));
        req.items = vec![req.items[0].clone(); 3];

        let order = fx
            .service
            .create_order(&fx.client, req)
            .await
            .unwrap();

        // Each line is 9.19575 at full precision
        assert!(order.items.iter().all(|i| i.to_amount == dec!(9.20)));
        assert_eq!(order.total_from_amount, dec!(30.15));
        assert_eq!(order.total_to_amount, dec!(27.60));

        let fetched = fx.service.get_order(&fx.client, order.id).await.unwrap();
        assert_eq!(fetched.total_to_amount, dec!(27.60));
    }

    #[tokio::test]
    async fn test_guest_order_can_be_tracked() {
        let fx = setup().await;
        let anon = Actor::anonymous();

        let order = fx
            .service
            .create_order(&anon, order_request(&fx.branch, dec!(10.01)))
            .await
            .unwrap();
        assert_eq!(order.user_id, None);
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(
            order.allowed_transitions,
            vec![OrderStatus::Processing, OrderStatus::Cancelled]
        );
        // Stored at full precision, shown at currency precision
        assert_eq!(order.items[0].to_amount, dec!(9.16));
        assert_eq!(order.total_to_amount, dec!(9.16));

        let tracking = fx
            .service
            .track_order(&anon, order.tracking_code.as_str())
            .await
            .unwrap();
        assert_eq!(tracking.status_display, "New");
        assert_eq!(tracking.items.len(), 1);

        assert!(matches!(
            fx.service.track_order(&anon, "NOSUCHCODE22").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            fx.service.list_orders(&anon).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            fx.service.get_order(&anon, order.id).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_order_visibility() {
        let fx = setup().await;
        let order = fx
            .service
            .create_order(&fx.client, order_request(&fx.branch, dec!(100)))
            .await
            .unwrap();
        assert_eq!(order.user_id, fx.client.user_id);

        assert!(fx.service.get_order(&fx.client, order.id).await.is_ok());
        assert!(fx.service.get_order(&fx.operator, order.id).await.is_ok());
        assert!(matches!(
            fx.service.get_order(&fx.other_client, order.id).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            fx.service.list_documents(&fx.other_client, order.id).await,
            Err(AppError::Forbidden(_))
        ));

        assert_eq!(fx.service.list_orders(&fx.client).await.unwrap().len(), 1);
        assert!(fx.service.list_orders(&fx.other_client).await.unwrap().is_empty());
        assert_eq!(fx.service.list_orders(&fx.operator).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let fx = setup().await;
        let order = fx
            .service
            .create_order(&fx.client, order_request(&fx.branch, dec!(100)))
            .await
            .unwrap();

        assert!(matches!(
            fx.service
                .update_order_status(
                    &fx.client,
                    order.id,
                    UpdateOrderStatusRequest {
                        status: OrderStatus::Processing
                    }
                )
                .await,
            Err(AppError::Forbidden(_))
        ));

        match move_to(&fx, &order, OrderStatus::Completed).await {
            Err(AppError::Domain(DomainError::InvalidTransition { allowed, .. })) => {
                assert_eq!(allowed, vec![OrderStatus::Processing, OrderStatus::Cancelled]);
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }

        move_to(&fx, &order, OrderStatus::Processing).await.unwrap();
        let waiting = move_to(&fx, &order, OrderStatus::WaitingDelivery).await.unwrap();
        assert_eq!(waiting.operator_id, fx.operator.user_id);
        assert_eq!(waiting.status_display, "Waiting for delivery");

        attach(&fx, &fx.client, &order, DocumentType::Receipt).await;
        match move_to(&fx, &order, OrderStatus::Completed).await {
            Err(AppError::Domain(DomainError::MissingRequirements { missing })) => {
                assert_eq!(missing, vec![DocumentType::Chat]);
            }
            other => panic!("expected MissingRequirements, got {:?}", other),
        }

        attach(&fx, &fx.operator, &order, DocumentType::Chat).await;
        let done = move_to(&fx, &order, OrderStatus::Completed).await.unwrap();
        assert_eq!(done.status, OrderStatus::Completed);
        assert!(done.allowed_transitions.is_empty());
        assert_eq!(done.documents.len(), 2);

        assert!(matches!(
            move_to(&fx, &order, OrderStatus::Cancelled).await,
            Err(AppError::Domain(DomainError::InvalidTransition { .. }))
        ));
    }

    #[tokio::test]
    async fn test_delete_order_needs_admin_and_new_status() {
        let fx = setup().await;
        let order = fx
            .service
            .create_order(&fx.client, order_request(&fx.branch, dec!(100)))
            .await
            .unwrap();

        assert!(matches!(
            fx.service.delete_order(&fx.operator, order.id).await,
            Err(AppError::Forbidden(_))
        ));

        move_to(&fx, &order, OrderStatus::Processing).await.unwrap();
        assert!(matches!(
            fx.service.delete_order(&fx.admin, order.id).await,
            Err(AppError::Domain(DomainError::Validation(_)))
        ));

        let fresh = fx
            .service
            .create_order(&fx.client, order_request(&fx.branch, dec!(100)))
            .await
            .unwrap();
        fx.service.delete_order(&fx.admin, fresh.id).await.unwrap();
        assert!(matches!(
            fx.service.get_order(&fx.admin, fresh.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reviews
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_review_flow() {
        let fx = setup().await;
        let order = completed_order(&fx).await;
        let req = CreateReviewRequest {
            order_id: order.id,
            rating: 5,
            text: "Fast and friendly".into(),
        };

        assert!(matches!(
            fx.service.create_review(&fx.other_client, req.clone()).await,
            Err(AppError::Forbidden(_))
        ));

        let review = fx.service.create_review(&fx.client, req).await.unwrap();
        assert!(!review.is_visible);
        assert!(
            fx.service
                .list_public_reviews(&Actor::anonymous())
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(fx.service.list_reviews(&fx.client).await.unwrap().len(), 1);
        assert!(fx.service.list_reviews(&fx.other_client).await.unwrap().is_empty());

        assert!(matches!(
            fx.service
                .set_review_visibility(&fx.operator, review.id, UpdateReviewRequest { is_visible: true })
                .await,
            Err(AppError::Forbidden(_))
        ));
        fx.service
            .set_review_visibility(&fx.admin, review.id, UpdateReviewRequest { is_visible: true })
            .await
            .unwrap();

        let public = fx
            .service
            .list_public_reviews(&Actor::anonymous())
            .await
            .unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].rating, 5);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_role_management() {
        let fx = setup().await;
        let client_id = fx.client.user_id.unwrap();
        let roles: BTreeSet<Role> = [Role::Administrator].into_iter().collect();

        assert!(matches!(
            fx.service
                .set_roles(&fx.admin, client_id, SetRolesRequest { roles: roles.clone() })
                .await,
            Err(AppError::Forbidden(_))
        ));

        let promoted = fx
            .service
            .set_roles(&fx.owner, client_id, SetRolesRequest { roles })
            .await
            .unwrap();
        assert!(promoted.roles.contains(&Role::Administrator));

        // The next request carries the new roles
        let actor = fx
            .service
            .identify(Identity {
                external_id: "sub-client@example.com".into(),
                email: "client@example.com".into(),
            })
            .await
            .unwrap();
        assert!(actor.has_any(&[Role::Administrator]));
        assert_eq!(fx.service.list_orders(&actor).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_referrals() {
        let fx = setup().await;
        let owner_profile = fx.service.me(&fx.owner).await.unwrap();

        let linked = fx
            .service
            .apply_referral(
                &fx.client,
                ApplyReferralRequest {
                    referral_code: owner_profile.referral_code.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(linked.referred_by, Some(owner_profile.id));

        let referrals = fx.service.list_referrals(&fx.owner).await.unwrap();
        assert_eq!(referrals.len(), 1);
        assert_eq!(referrals[0].username, "client");

        assert!(matches!(
            fx.service
                .apply_referral(
                    &fx.client,
                    ApplyReferralRequest {
                        referral_code: "  ".into()
                    }
                )
                .await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            fx.service.me(&Actor::anonymous()).await,
            Err(AppError::Unauthorized(_))
        ));
    }
}
