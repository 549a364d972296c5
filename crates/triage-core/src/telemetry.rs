use std::fmt as StdFmt;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider, Tracer};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_opentelemetry::{OpenTelemetrySpanExt, OtelData};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{self, FmtContext};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{AppConfig, TelemetryConfig};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Owns the tracer provider; pending spans are flushed when it drops.
#[derive(Default)]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("failed to flush traces: {err}");
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
}

/// Install the global subscriber: `RUST_LOG` filtering (default `info`), pretty
/// stderr output when `app.env` is `dev` and JSON lines otherwise, plus OTLP
/// export when configured. Only the first call installs anything.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    if INSTALLED.get().is_some() {
        return Ok(TelemetryGuard::default());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let provider = build_provider(app, telemetry)?;
    let otel_layer = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(tracer(provider, app)));

    let fmt_layer = if app.env.eq_ignore_ascii_case("dev") {
        fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().event_format(JsonLogFormatter).boxed()
    };

    let subscriber = Registry::default()
        .with(SpanFieldsLayer)
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;
    let _ = INSTALLED.set(());

    Ok(TelemetryGuard { provider })
}

fn build_provider(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<Option<SdkTracerProvider>, TelemetryError> {
    if !telemetry.export_traces {
        return Ok(None);
    }
    let Some(endpoint) = telemetry
        .otlp_endpoint
        .as_deref()
        .filter(|endpoint| !endpoint.is_empty())
    else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(Duration::from_secs(3))
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

fn tracer(provider: &SdkTracerProvider, app: &AppConfig) -> Tracer {
    provider.tracer(app.service_name.clone())
}

/// Span fields captured as JSON so every event inside a span can repeat them.
struct SpanFields(Map<String, Value>);

/// Records span attributes (such as a batch run's `job_id`) into span extensions.
struct SpanFieldsLayer;

impl<S> Layer<S> for SpanFieldsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            let mut visitor = JsonVisitor {
                fields: std::mem::take(fields),
            };
            values.record(&mut visitor);
            *fields = visitor.fields;
        }
    }
}

/// One JSON object per line: timestamp, level, target, innermost span name,
/// merged span fields (outermost first), trace id and event fields.
struct JsonLogFormatter;

impl<S, N> FormatEvent<S, N> for JsonLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> StdFmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut span_fields = Map::new();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if let Some(SpanFields(fields)) = span.extensions().get::<SpanFields>() {
                    span_fields.extend(fields.clone());
                }
            }
        }

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

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": event.metadata().level().as_str().to_lowercase(),
            "target": event.metadata().target(),
            "span": current.as_ref().map(|span| span.name()),
            "span_fields": span_fields,
            "trace_id": trace_id,
            "fields": visitor.fields,
        });

        let serialized = serde_json::to_string(&payload).map_err(|_| StdFmt::Error)?;
        writer.write_str(&serialized)?;
        writer.write_str("\n")
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: Map<String, Value>,
}

impl tracing_subscriber::field::Visit for JsonVisitor {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn StdFmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}").into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    static INIT_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[derive(Clone, Default)]
    struct BufferWriter {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.lock().expect("lock buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl BufferWriter {
        fn lines(&self) -> Vec<Value> {
            let output =
                String::from_utf8(self.buf.lock().expect("lock buffer").clone()).expect("utf8");
            output
                .lines()
                .map(|line| serde_json::from_str(line).expect("json line"))
                .collect()
        }
    }

    #[test]
    fn init_is_idempotent_without_endpoint() {
        let _guard = INIT_GUARD.lock().expect("lock init");
        let app = AppConfig {
            service_name: "triage".into(),
            port: 0,
            env: "prod".into(),
        };
        let telemetry = TelemetryConfig {
            otlp_endpoint: None,
            export_traces: true,
        };

        init_telemetry(&app, &telemetry).expect("telemetry initializes without endpoint");
        init_telemetry(&app, &telemetry).expect("second init is a no-op");
    }

    #[test]
    fn json_lines_carry_job_span_fields() {
        let writer = BufferWriter::default();
        let make_writer = {
            let writer = writer.clone();
            move || writer.clone()
        };
        let subscriber = Registry::default().with(SpanFieldsLayer).with(
            fmt::layer()
                .event_format(JsonLogFormatter)
                .with_writer(make_writer),
        );

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("rule_application", job_id = "job-1", mode = "all_rules");
            let _entered = span.enter();
            tracing::warn!(message_id = 7_i64, "failed to apply rule action");
        });

        let lines = writer.lines();
        assert_eq!(lines.len(), 1);
        let payload = &lines[0];
        assert_eq!(payload["level"], "warn");
        assert_eq!(payload["span"], "rule_application");
        assert_eq!(payload["span_fields"]["job_id"], "job-1");
        assert_eq!(payload["span_fields"]["mode"], "all_rules");
        assert_eq!(payload["fields"]["message_id"], 7);
        assert_eq!(payload["fields"]["message"], "failed to apply rule action");
        assert!(payload["trace_id"].is_null());

        let ts = payload["timestamp"].as_str().expect("timestamp string");
        assert!(ts.ends_with('Z') && ts.contains('T'), "timestamp should be RFC3339, got {ts}");
    }

    #[test]
    fn json_lines_include_trace_id_with_otel_layer() {
        let writer = BufferWriter::default();
        let make_writer = {
            let writer = writer.clone();
            move || writer.clone()
        };
        let provider = SdkTracerProvider::builder().build();
        let subscriber = Registry::default()
            .with(SpanFieldsLayer)
            .with(
                fmt::layer()
                    .event_format(JsonLogFormatter)
                    .with_writer(make_writer),
            )
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        let mut expected = None;
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("rule_application", job_id = "job-2");
            expected = Some(span.context().span().span_context().trace_id().to_string());
            let _entered = span.enter();
            tracing::info!("rule application completed");
        });

        let lines = writer.lines();
        assert_eq!(lines[0]["trace_id"], expected.expect("trace id"));
        assert_eq!(lines[0]["span_fields"]["job_id"], "job-2");
    }
}
