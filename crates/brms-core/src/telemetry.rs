//! Structured logging and optional OTLP trace export.
//!
//! `RUST_LOG` drives the filter (default `info`). The `dev` environment logs
//! human-readable output to stderr; every other environment emits one JSON
//! object per line carrying the active span name and trace id. When a log
//! file is configured the JSON lines are also appended to it.

use std::fmt as StdFmt;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_opentelemetry::{OpenTelemetrySpanExt, OtelData};
use tracing_subscriber::fmt::format::{DefaultFields, FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{self, FmtContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{AppConfig, TelemetryConfig};

static INSTALLED: OnceLock<()> = OnceLock::new();

const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Keeps the tracer provider alive; pending spans are flushed on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn exports_traces(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("failed to flush trace exporter: {err}");
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        source: std::io::Error,
    },
}

/// Install the global subscriber. Later calls are no-ops that return an empty guard.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
    log_file: Option<&Path>,
) -> Result<TelemetryGuard, TelemetryError> {
    if INSTALLED.get().is_some() {
        return Ok(TelemetryGuard { provider: None });
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let provider = build_provider(app, telemetry)?;
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(app.service_name.clone()))
    });

    let file_layer = log_file.map(log_file_layer).transpose()?;

    let registry = Registry::default()
        .with(otel_layer)
        .with(env_filter)
        .with(file_layer);
    let installed = if app.env.eq_ignore_ascii_case("dev") {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().event_format(JsonLineFormatter))
            .try_init()
    };
    installed.map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;
    let _ = INSTALLED.set(());

    Ok(TelemetryGuard { provider })
}

/// JSON lines appended to `path`. Missing parent directories are created.
fn log_file_layer<S>(
    path: &Path,
) -> Result<fmt::Layer<S, DefaultFields, JsonLineFormatter, Arc<File>>, TelemetryError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let open = || {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    };
    let file = open().map_err(|source| TelemetryError::LogFile {
        path: path.display().to_string(),
        source,
    })?;

    Ok(fmt::layer()
        .event_format(JsonLineFormatter)
        .with_ansi(false)
        .with_writer(Arc::new(file)))
}

fn build_provider(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<Option<SdkTracerProvider>, TelemetryError> {
    let endpoint = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) if telemetry.export_traces && !endpoint.is_empty() => endpoint,
        _ => return Ok(None),
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(EXPORT_TIMEOUT)
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::ExporterBuild(err.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", app.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", app.env.clone()),
        ])
        .build();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    Ok(Some(provider))
}

/// One JSON object per event: timestamp, level, target, message, span, trace id, fields.
struct JsonLineFormatter;

impl<S, N> FormatEvent<S, N> for JsonLineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> StdFmt::Result {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let current = ctx.lookup_current();
        let trace_id = current
            .as_ref()
            .and_then(|span| {
                span.extensions()
                    .get::<OtelData>()
                    .and_then(|data| data.trace_id())
            })
            .or_else(|| {
                let span_ctx = tracing::Span::current().context().span().span_context().clone();
                span_ctx.is_valid().then(|| span_ctx.trace_id())
            })
            .map(|id| id.to_string());

        let metadata = event.metadata();
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": metadata.level().as_str().to_lowercase(),
            "target": metadata.target(),
            "message": fields.message,
            "span": current.map(|span| span.name()),
            "trace_id": trace_id,
            "fields": fields.values,
        });

        let serialized = serde_json::to_string(&line).map_err(|_| StdFmt::Error)?;
        writeln!(writer, "{serialized}")
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: Map<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.values.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn StdFmt::Debug) {
        self.insert(field, format!("{value:?}").into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().expect("lock buffer").clone();
            String::from_utf8(bytes)
                .expect("utf8 output")
                .lines()
                .map(|line| serde_json::from_str(line).expect("json line"))
                .collect()
        }
    }

    #[test]
    fn telemetry_without_endpoint_does_not_export() {
        let app = AppConfig {
            service_name: "brms".into(),
            port: 0,
            env: "prod".into(),
            request_timeout_secs: 30,
            cors_origins: Vec::new(),
        };
        let telemetry = TelemetryConfig {
            otlp_endpoint: None,
            export_traces: true,
        };

        let guard = init_telemetry(&app, &telemetry, None).expect("telemetry initializes");
        assert!(!guard.exports_traces());
        init_telemetry(&app, &telemetry, None).expect("second init is a no-op");
    }

    #[test]
    fn json_lines_carry_message_fields_and_trace_id() {
        let buffer = SharedBuffer::default();
        let writer = {
            let buffer = buffer.clone();
            move || buffer.clone()
        };

        let provider = SdkTracerProvider::builder().build();
        let subscriber = Registry::default()
            .with(fmt::layer().event_format(JsonLineFormatter).with_writer(writer))
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        let mut expected_trace_id = String::new();
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("execute_rule_set");
            expected_trace_id = span.context().span().span_context().trace_id().to_string();
            let _entered = span.enter();
            tracing::info!(rule_id = 3, matched = true, "rule matched");
        });

        let lines = buffer.lines();
        let line = lines.first().expect("one log line");
        assert_eq!(line["level"], "info");
        assert_eq!(line["message"], "rule matched");
        assert_eq!(line["span"], "execute_rule_set");
        assert_eq!(line["fields"]["rule_id"], 3);
        assert_eq!(line["fields"]["matched"], true);
        assert_eq!(line["trace_id"], expected_trace_id.as_str());
        assert!(line["fields"].get("message").is_none());
    }

    #[test]
    fn file_log_receives_events() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("logs").join("server.log");

        let layer = log_file_layer(&path).expect("log file opens");
        tracing::subscriber::with_default(Registry::default().with(layer), || {
            tracing::info!(rule_set = "loan-policy", "rule set created");
        });

        let contents = fs::read_to_string(&path).expect("log file readable");
        let line: Value = serde_json::from_str(contents.lines().next().expect("one line"))
            .expect("json line");
        assert_eq!(line["message"], "rule set created");
        assert_eq!(line["fields"]["rule_set"], "loan-policy");

        let layer = log_file_layer(&path).expect("log file reopens");
        tracing::subscriber::with_default(Registry::default().with(layer), || {
            tracing::warn!("second run");
        });
        let contents = fs::read_to_string(&path).expect("log file readable");
        assert_eq!(contents.lines().count(), 2);
    }
}
