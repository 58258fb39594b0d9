use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-pier";
const OTEL_STDOUT_ENV: &str = "BEACH_PIER_OTEL_STDOUT";
const DEFAULT_FILTER: &str = "info,beach_pier=info,pier_proto=info";

/// Chunks per forwarded or relayed transfer; 1 MiB chunks up to the 100 MiB cap.
const CHUNK_SEQUENCE_BUCKETS: &[f64] = &[2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 100.0];

/// Process-wide logging, tracing and metrics. Keep it alive for the lifetime of `main`.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("pier_chunk_sequence_len".into()),
                CHUNK_SEQUENCE_BUCKETS,
            )
            .context("invalid histogram buckets")?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    provider
}

/// Registers help text for every series the bridge emits.
fn describe_metrics() {
    describe_gauge!("pier_links_active", "Backend links currently held by the pool");
    describe_gauge!("pier_links_healthy", "Backend links that are connected and healthy");
    describe_gauge!("pier_clients_active", "Browser clients attached to a backend link");
    describe_gauge!("pier_sessions_cached", "Sessions held in the extractor cache");

    describe_counter!("pier_admissions_total", "Client admissions by result");
    describe_counter!("pier_breaker_open_total", "Times the admission circuit breaker opened");
    describe_counter!("pier_dial_failures_total", "Backend dials that failed, by reason");
    describe_counter!("pier_reconnects_total", "Reconnects scheduled after a backend link dropped");
    describe_counter!("pier_queue_evictions_total", "Queued messages evicted at capacity");
    describe_counter!("pier_chunks_expired_total", "Chunked transfers purged before completion");
    describe_counter!("pier_frames_rejected_total", "Frames rejected by the codec, by reason");
    describe_counter!("pier_frames_relayed_total", "Frames relayed, by direction");
    describe_counter!(
        "pier_bytes_relayed_total",
        Unit::Bytes,
        "Wire bytes relayed, by direction"
    );

    describe_histogram!("pier_chunk_sequence_len", Unit::Count, "Chunks per split transfer");
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
