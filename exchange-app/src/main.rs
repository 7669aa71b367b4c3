//! # Exchange Application
//!
//! Binary that wires together all the components:
//! - Load configuration from environment
//! - Initialize tracing, with OpenTelemetry export when configured
//! - Initialize the repository adapter
//! - Start the notification worker when a webhook is configured
//! - Create the exchange service and start the HTTP server

mod config;

use std::sync::Arc;

use opentelemetry::global;
use opentelemetry_sdk::{
    metrics::SdkMeterProvider, propagation::TraceContextPropagator, trace as sdktrace,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use exchange_hex::{
    ExchangeService,
    inbound::{HttpServer, JwtVerifier},
};
use exchange_repo::{NotificationWorker, build_repo};
use exchange_types::IdentityVerifier;

/// OpenTelemetry providers that must be flushed on exit.
struct Telemetry {
    tracer: sdktrace::Tracer,
    tracer_provider: sdktrace::SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    fn shutdown(self) {
        let _ = self.tracer_provider.shutdown();
        let _ = self.meter_provider.shutdown();
    }
}

/// Sets up OTLP trace and metric export over gRPC.
///
/// The exporters read `OTEL_EXPORTER_OTLP_ENDPOINT` themselves.
fn init_telemetry() -> anyhow::Result<Telemetry> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    // Use gRPC exporter with batch processing (non-blocking)
    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;
    let tracer_provider = sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    // HTTP metrics layer reads the global meter provider
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();
    global::set_meter_provider(meter_provider.clone());

    use opentelemetry::trace::TracerProvider as _;
    Ok(Telemetry {
        tracer: tracer_provider.tracer("exchange-service"),
        tracer_provider,
        meter_provider,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = config::Config::from_env()?;

    let telemetry = match config.otlp_endpoint {
        Some(_) => Some(init_telemetry()?),
        None => None,
    };
    let otel_layer = telemetry
        .as_ref()
        .map(|t| tracing_opentelemetry::layer().with_tracer(t.tracer.clone()));

    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,exchange_app=debug,exchange_hex=debug,exchange_repo=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    tracing::info!("Starting exchange server on port {}", config.port);
    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!("Exporting telemetry to {}", endpoint);
    }

    // Build repository (handles connection and migration)
    let repo = Arc::new(build_repo(&config.database_url).await?);

    match &config.notify {
        Some(notify) => {
            let worker = NotificationWorker::new(
                repo.clone(),
                notify.webhook_url.clone(),
                notify.secret.clone(),
            );
            tokio::spawn(worker.run());
        }
        None => tracing::info!("NOTIFY_WEBHOOK_URL not set, order notifications stay queued"),
    }

    // Create the exchange service
    let service = ExchangeService::new(repo);
    let verifier: Arc<dyn IdentityVerifier> =
        Arc::new(JwtVerifier::new(&config.jwt_secret, &config.jwt_audience));

    // Create and run the HTTP server
    let server = HttpServer::with_rate_limit(service, verifier, config.rate_limit_per_minute);
    let addr = format!("0.0.0.0:{}", config.port);

    server.run(&addr).await?;

    // Ensure traces and metrics are flushed before exit
    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    Ok(())
}
