use anyhow::{Context, Result};
use base64ct::{Base64, Encoding};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, SpanExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::{collections::HashMap, env::var, sync::OnceLock, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

static PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// `k1=v1,k2=v2` as used by `OTEL_EXPORTER_OTLP_HEADERS`. Pairs without `=` are dropped.
fn parse_headers_env(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect()
}

// Names ending in "-bin" carry base64 and become binary metadata.
fn headers_to_metadata(headers: &HashMap<String, String>) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if name.ends_with("-bin") {
            let decoded = Base64::decode_vec(value)
                .map_err(|e| anyhow::anyhow!("failed to base64-decode header {name}: {e}"))?;
            let key = MetadataKey::<Binary>::from_bytes(name.as_bytes())
                .with_context(|| format!("bad binary header name {name}"))?;
            metadata.insert_bin(key, MetadataValue::from_bytes(&decoded));
        } else {
            let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
                .with_context(|| format!("bad header name {name}"))?;
            let value = MetadataValue::<Ascii>::try_from(value.as_str())
                .with_context(|| format!("bad value for header {name}"))?;
            metadata.insert(key, value);
        }
    }
    Ok(metadata)
}

/// Bare `host:port` endpoints are assumed to speak TLS.
fn normalize_endpoint(endpoint: &str) -> String {
    match endpoint.split_once("://") {
        Some(("http" | "https", _)) => endpoint.to_string(),
        _ => format!("https://{}", endpoint.trim_end_matches('/')),
    }
}

fn tls_host(endpoint: &str) -> Option<&str> {
    let authority = endpoint.strip_prefix("https://")?.split('/').next()?;
    authority.split(':').next()
}

fn exporter(endpoint: &str) -> Result<SpanExporter> {
    let mut builder = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(Duration::from_secs(3));

    if let Some(host) = tls_host(endpoint) {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(host.to_string())
                .with_native_roots(),
        );
    }

    let headers = var("OTEL_EXPORTER_OTLP_HEADERS")
        .map(|raw| parse_headers_env(&raw))
        .unwrap_or_default();
    if !headers.is_empty() {
        builder = builder.with_metadata(headers_to_metadata(&headers)?);
    }

    Ok(builder.build()?)
}

fn resource() -> Resource {
    let instance = var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance),
        ])
        .build()
}

fn init_tracer(endpoint: &str) -> Result<Tracer> {
    if let Ok(protocol) = var("OTEL_EXPORTER_OTLP_PROTOCOL")
        && protocol != "grpc"
    {
        debug!("ignoring OTEL_EXPORTER_OTLP_PROTOCOL={protocol}, exporting over grpc");
    }

    let endpoint = normalize_endpoint(endpoint);
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter(&endpoint)?)
        .with_resource(resource())
        .build();

    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
    let _ = PROVIDER.set(provider);

    Ok(tracer)
}

fn filter(level: Level) -> Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    for directive in ["hyper=error", "tokio=error", "sqlx=warn", "opentelemetry_sdk=warn"] {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity_level`.
///
/// Spans are exported over OTLP/gRPC only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// # Errors
///
/// Returns an error if the exporter or the subscriber cannot be installed
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let otel = match var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(init_tracer(&endpoint)?)),
        Err(_) => None,
    };

    let subscriber = Registry::default()
        .with(
            fmt::layer()
                .pretty()
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(otel)
        .with(filter(verbosity_level.unwrap_or(Level::ERROR))?);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// Flush and stop the exporter, if one was started.
pub fn shutdown_tracer() {
    if let Some(provider) = PROVIDER.get() {
        debug!("flushing spans");
        if let Err(err) = provider.shutdown() {
            debug!("tracer shutdown: {err}");
        }
    }
}
