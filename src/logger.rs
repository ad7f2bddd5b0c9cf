use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::{FutureExt, Status, TraceContextExt, Tracer};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "comfyforms";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `comfyforms=debug,tower_http=info`.
    pub log_level: String,
    /// Rolling text log plus a JSON request log are written here when set.
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP collector for logs, traces and metrics.
    pub otel_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

/// Providers that need flushing on exit.
#[derive(Default)]
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("log exporter shutdown failed: {e}");
            }
        }
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("trace exporter shutdown failed: {e}");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("metric exporter shutdown failed: {e}");
            }
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(end_point: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Installs the global subscriber: stdout always, rolling files and OTLP
/// export when configured.
pub fn init_tracing(config: &LogConfig) -> Result<Telemetry> {
    let env_filter = Context::with_context(EnvFilter::try_new(&config.log_level), || {
        format!("bad log level `{}`", config.log_level)
    })?;
    let stdout_layer = fmt::layer().with_thread_names(true);

    let (text_layer, request_layer) = match &config.log_dir {
        Some(dir) => {
            Context::with_context(std::fs::create_dir_all(dir), || {
                format!("cannot create {}", dir.display())
            })?;
            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, "comfyforms.log");
            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, "requests.log");
            let text = fmt::layer().with_writer(txt_appender).with_ansi(false);
            let requests = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new("request=info"));
            (Some(text), Some(requests))
        }
        None => (None, None),
    };

    let mut telemetry = Telemetry::default();
    let otel_layer = match &config.otel_endpoint {
        Some(end_point) => {
            let logger_provider = init_logs(end_point)?;
            let tracer_provider = init_traces(end_point)?;
            let meter_provider = init_metrics(end_point)?;
            let filter = EnvFilter::try_new(&config.log_level)?
                .add_directive("hyper=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            let layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter);
            global::set_tracer_provider(tracer_provider.clone());
            global::set_meter_provider(meter_provider.clone());
            telemetry.logger_provider = Some(logger_provider);
            telemetry.tracer_provider = Some(tracer_provider);
            telemetry.meter_provider = Some(meter_provider);
            Some(layer)
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(text_layer)
        .with(request_layer)
        .with(otel_layer)
        .try_init()
        .context("a global subscriber is already installed")?;

    Ok(telemetry)
}

/// Request counters and latency histogram, recorded through the global meter.
///
/// Build it after `init_tracing` so the instruments bind to the installed
/// meter provider rather than the no-op one.
#[derive(Clone)]
pub struct RequestTelemetry {
    pub requests_started: Counter<u64>,
    pub requests_succeeded: Counter<u64>,
    pub requests_failed: Counter<u64>,
    pub request_latency_ms: Histogram<f64>,
}

impl RequestTelemetry {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        let requests_started = meter
            .u64_counter("requests_started")
            .with_description("Total requests started")
            .build();
        let requests_succeeded = meter.u64_counter("requests_succeeded").build();
        let requests_failed = meter.u64_counter("requests_failed").build();
        let request_latency_ms = meter
            .f64_histogram("request_latency_ms")
            .with_description("Latency per request in ms")
            .with_unit("ms")
            .build();

        Self {
            requests_started,
            requests_succeeded,
            requests_failed,
            request_latency_ms,
        }
    }

    /// Wraps a request handler with a span, metrics, a log line and one JSON
    /// event under the `request` target.
    pub async fn instrument_request<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.requests_started.add(1, &[]);
        let start = Instant::now();
        let span = global::tracer(SERVICE_NAME).start(name.to_string());
        let cx = opentelemetry::Context::current_with_span(span);

        let result = handler().with_context(cx.clone()).await;

        if let Err(err) = &result {
            cx.span().set_status(Status::error(err.to_string()));
        }
        cx.span().end();

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.request_latency_ms.record(elapsed, &[]);
        match &result {
            Ok(_) => {
                self.requests_succeeded.add(1, &[]);
                info!("request `{}` succeeded in {:.1} ms", name, elapsed);
            }
            Err(err) => {
                self.requests_failed.add(1, &[]);
                error!(error = %err, "request `{}` failed in {:.1} ms", name, elapsed);
            }
        }

        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = name,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        result
    }
}

impl Default for RequestTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
