//! HTTP Server configuration and startup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{get, patch, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use exchange_types::{ExchangeRepository, IdentityVerifier};

use super::auth::auth_middleware;
use super::handlers::{self, AppState};
use super::rate_limit::{RateLimiterState, rate_limit_middleware};
use crate::ExchangeService;
use crate::openapi::ApiDoc;

/// HTTP Server for the exchange back office API.
pub struct HttpServer<R: ExchangeRepository> {
    state: Arc<AppState<R>>,
}

impl<R: ExchangeRepository> HttpServer<R> {
    /// Creates a new HTTP server allowing 100 requests per minute per caller.
    pub fn new(service: ExchangeService<R>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            state: Arc::new(AppState {
                service,
                verifier,
                rate_limiter: Arc::new(RateLimiterState::default()),
            }),
        }
    }

    /// Creates a new HTTP server with custom rate limiting.
    pub fn with_rate_limit(
        service: ExchangeService<R>,
        verifier: Arc<dyn IdentityVerifier>,
        requests_per_minute: u32,
    ) -> Self {
        Self {
            state: Arc::new(AppState {
                service,
                verifier,
                rate_limiter: Arc::new(RateLimiterState::new(
                    requests_per_minute,
                    Duration::from_secs(60),
                )),
            }),
        }
    }

    /// Builds the Axum router with all routes.
    pub fn router(&self) -> Router {
        // Build HTTP metrics layer (uses globally set MeterProvider)
        let metrics = axum_otel_metrics::HttpMetricsLayerBuilder::new().build();

        let api = Router::new()
            .route("/health", get(handlers::health))
            // Catalog
            .route(
                "/api/currencies",
                get(handlers::list_currencies::<R>).post(handlers::create_currency::<R>),
            )
            .route(
                "/api/currencies/{code}",
                get(handlers::get_currency::<R>).patch(handlers::update_currency::<R>),
            )
            .route(
                "/api/branches",
                get(handlers::list_branches::<R>).post(handlers::create_branch::<R>),
            )
            .route("/api/branches/{id}", get(handlers::get_branch::<R>))
            .route(
                "/api/branches/{id}/balances",
                get(handlers::list_balances::<R>),
            )
            .route(
                "/api/branches/{id}/balances/purchase",
                post(handlers::record_purchase::<R>),
            )
            .route(
                "/api/rates",
                get(handlers::list_rates::<R>).post(handlers::create_rate::<R>),
            )
            .route(
                "/api/rates/{id}",
                get(handlers::get_rate::<R>).patch(handlers::update_rate::<R>),
            )
            .route("/api/rates/{id}/quote", post(handlers::quote::<R>))
            // Orders
            .route(
                "/api/orders",
                get(handlers::list_orders::<R>).post(handlers::create_order::<R>),
            )
            .route(
                "/api/orders/{id}",
                get(handlers::get_order::<R>).delete(handlers::delete_order::<R>),
            )
            .route(
                "/api/orders/{id}/status",
                patch(handlers::update_order_status::<R>),
            )
            .route(
                "/api/orders/{id}/documents",
                get(handlers::list_documents::<R>).post(handlers::attach_document::<R>),
            )
            .route("/api/track/{tracking_code}", get(handlers::track_order::<R>))
            // Reviews
            .route(
                "/api/reviews",
                get(handlers::list_reviews::<R>).post(handlers::create_review::<R>),
            )
            .route("/api/reviews/public", get(handlers::list_public_reviews::<R>))
            .route("/api/reviews/{id}", patch(handlers::update_review::<R>))
            // Users
            .route(
                "/api/users/me",
                get(handlers::me::<R>).patch(handlers::update_me::<R>),
            )
            .route("/api/users/me/referral", post(handlers::apply_referral::<R>))
            .route("/api/users/me/referrals", get(handlers::list_referrals::<R>))
            .route("/api/users/{id}/roles", put(handlers::set_roles::<R>))
            .layer(metrics)
            // Throttling needs the actor, so auth wraps it
            .layer(middleware::from_fn_with_state(
                self.state.rate_limiter.clone(),
                rate_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth_middleware::<R>,
            ))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        api.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
    }

    /// Runs the server on the given address with graceful shutdown.
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
