//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the process-wide tracing subscriber (once)
//! - Reconfigure threshold and line format at runtime
//! - Provide [`Logger`], a scoped facade handed to app code
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Threshold is a reloadable `EnvFilter` (initially `RUST_LOG`, else `info`)
//! - JSON and logfmt layers are both installed; events reach only the active
//!   one, spans reach both so switching format keeps span context
//! - JSON lines nest structured fields as objects (see [`JsonLines`])
//! - Direct console output goes through [`Logger::console`], gated by
//!   `log.console`

use std::fmt::Write as _;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::field::{self, Field, Visit};
use tracing::{Event, Span, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields, JsonFields};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::schema::{ConsoleUse, LogFormat, LogLevel};

/// Event field carrying structured data as JSON text.
const STRUCTURED_FIELD: &str = "fields";

/// Upper bound on waiting for log output to drain during shutdown.
pub const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const FORMAT_JSON: u8 = 0;
const FORMAT_LOGFMT: u8 = 1;

static ACTIVE_FORMAT: AtomicU8 = AtomicU8::new(FORMAT_JSON);
static LOGGING: OnceLock<LoggingHandles> = OnceLock::new();

struct LoggingHandles {
    filter: reload::Handle<EnvFilter, Registry>,
    installed: bool,
}

fn format_code(format: LogFormat) -> u8 {
    match format {
        LogFormat::Json => FORMAT_JSON,
        LogFormat::Logfmt => FORMAT_LOGFMT,
    }
}

/// Install the global subscriber if nobody has yet.
///
/// Returns `false` when another subscriber was already set; logging then goes
/// wherever that subscriber sends it and reconfiguration is a no-op.
pub fn init_logging() -> bool {
    LOGGING
        .get_or_init(|| {
            let initial =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let (filter_layer, filter) = reload::Layer::new(initial);

            let json = fmt::layer()
                .fmt_fields(JsonFields::new())
                .event_format(JsonLines)
                .with_filter(filter_fn(|meta| {
                    meta.is_span() || ACTIVE_FORMAT.load(Ordering::Relaxed) == FORMAT_JSON
                }));
            let logfmt = fmt::layer().compact().with_filter(filter_fn(|meta| {
                meta.is_span() || ACTIVE_FORMAT.load(Ordering::Relaxed) == FORMAT_LOGFMT
            }));

            let installed = tracing_subscriber::registry()
                .with(filter_layer)
                .with(json)
                .with(logfmt)
                .try_init()
                .is_ok();

            LoggingHandles { filter, installed }
        })
        .installed
}

/// One JSON object per event.
///
/// ```text
/// {"timestamp":..,"level":"WARN","target":..,
///  "fields":{"message":..,"scope":..,<structured keys>},
///  "span":{"name":"run","app":..,"run_id":..}}
/// ```
///
/// The structured `fields` value emitted by [`Logger::log`] is merged into
/// `fields` key by key instead of appearing as an escaped string.
pub struct JsonLines;

impl<S, N> FormatEvent<S, N> for JsonLines
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let mut timestamp = String::new();
        SystemTime.format_time(&mut format::Writer::new(&mut timestamp))?;

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let mut line = Map::new();
        line.insert("timestamp".into(), Value::String(timestamp));
        line.insert("level".into(), Value::String(meta.level().to_string()));
        line.insert("target".into(), Value::String(meta.target().to_string()));
        line.insert("fields".into(), Value::Object(fields.0));

        if let Some(span) = ctx.lookup_current() {
            let mut current = Map::new();
            current.insert("name".into(), Value::String(span.name().to_string()));
            let extensions = span.extensions();
            if let Some(formatted) = extensions.get::<FormattedFields<N>>() {
                if let Ok(Value::Object(span_fields)) = serde_json::from_str(formatted.as_str()) {
                    current.extend(span_fields);
                }
            }
            line.insert("span".into(), Value::Object(current));
        }

        writeln!(writer, "{}", Value::Object(line))
    }
}

#[derive(Default)]
struct FieldVisitor(Map<String, Value>);

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        if field.name() == STRUCTURED_FIELD {
            if let Ok(Value::Object(structured)) = serde_json::from_str(&text) {
                for (key, value) in structured {
                    self.0.entry(key).or_insert(value);
                }
                return;
            }
        }
        self.0.insert(field.name().into(), Value::String(text));
    }
}

/// Change the global threshold.
pub fn set_level(level: LogLevel) {
    let Some(handles) = LOGGING.get() else {
        return;
    };
    if let Err(e) = handles.filter.reload(EnvFilter::new(level.as_directive())) {
        tracing::warn!(error = %e, "Failed to reconfigure log level");
    }
}

/// Change the line format.
pub fn set_format(format: LogFormat) {
    ACTIVE_FORMAT.store(format_code(format), Ordering::Relaxed);
}

/// Wait until buffered log output has been flushed, at most
/// [`LOG_DRAIN_TIMEOUT`]. Returns `false` on timeout or write error.
pub async fn wait_for_idle() -> bool {
    let flush = tokio::task::spawn_blocking(|| std::io::stdout().lock().flush());
    matches!(
        tokio::time::timeout(LOG_DRAIN_TIMEOUT, flush).await,
        Ok(Ok(Ok(())))
    )
}

fn console_code(console: ConsoleUse) -> u8 {
    match console {
        ConsoleUse::Accepted => 0,
        ConsoleUse::ToLog => 1,
        ConsoleUse::BlockAndWarn => 2,
        ConsoleUse::Block => 3,
    }
}

fn console_from_code(code: u8) -> ConsoleUse {
    match code {
        1 => ConsoleUse::ToLog,
        2 => ConsoleUse::BlockAndWarn,
        3 => ConsoleUse::Block,
        _ => ConsoleUse::Accepted,
    }
}

/// A named logging scope.
///
/// Every event is emitted inside the run span (app, version, run id) and
/// carries a `scope` field. Children share the console policy of their root.
#[derive(Debug, Clone)]
pub struct Logger {
    scope: Arc<str>,
    span: Span,
    console: Arc<AtomicU8>,
}

impl Logger {
    pub fn new(scope: impl Into<String>, span: Span) -> Self {
        Self {
            scope: Arc::from(scope.into()),
            span,
            console: Arc::new(AtomicU8::new(console_code(ConsoleUse::Accepted))),
        }
    }

    /// Root logger for one run of `app`.
    pub fn for_run(app: &str, version: &str, run_id: &str) -> Self {
        let span = tracing::info_span!("run", app = %app, version = %version, run_id = %run_id);
        Self::new(app, span)
    }

    /// A logger whose scope is `<parent>.<scope>`.
    pub fn child(&self, scope: &str) -> Self {
        Self {
            scope: Arc::from(format!("{}.{}", self.scope, scope)),
            span: self.span.clone(),
            console: self.console.clone(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Emit `message` at `level` with optional structured `fields`.
    pub fn log(&self, level: LogLevel, message: &str, fields: Option<&serde_json::Value>) {
        let scope = &*self.scope;
        let fields = fields.map(field::display);
        self.span.in_scope(|| match level {
            LogLevel::Fatal => tracing::error!(scope, fatal = true, fields, "{}", message),
            LogLevel::Error => tracing::error!(scope, fields, "{}", message),
            LogLevel::Warning => tracing::warn!(scope, fields, "{}", message),
            LogLevel::Info => tracing::info!(scope, fields, "{}", message),
            LogLevel::Debug => tracing::debug!(scope, fields, "{}", message),
            LogLevel::Trace => tracing::trace!(scope, fields, "{}", message),
        });
    }

    pub fn fatal(&self, message: &str) {
        self.log(LogLevel::Fatal, message, None);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, None);
    }

    pub fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message, None);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, None);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, None);
    }

    pub fn set_level(&self, level: LogLevel) {
        set_level(level);
    }

    pub fn set_format(&self, format: LogFormat) {
        set_format(format);
    }

    pub fn console_use(&self) -> ConsoleUse {
        console_from_code(self.console.load(Ordering::Relaxed))
    }

    pub fn set_console_use(&self, console: ConsoleUse) {
        self.console.store(console_code(console), Ordering::Relaxed);
    }

    /// Write `text` for a human at a terminal, as `log.console` allows.
    pub fn console(&self, text: &str) {
        match self.console_use() {
            ConsoleUse::Accepted => {
                let mut stdout = std::io::stdout().lock();
                // A closed stdout is not worth failing over.
                let _ = writeln!(stdout, "{text}");
            }
            ConsoleUse::ToLog => self.log(LogLevel::Info, text, Some(&json!({ "console": true }))),
            ConsoleUse::BlockAndWarn => self.log(
                LogLevel::Warning,
                "console output blocked, use the logger instead",
                Some(&json!({ "text": text })),
            ),
            ConsoleUse::Block => {}
        }
    }

    pub async fn wait_for_idle(&self) -> bool {
        wait_for_idle().await
    }
}
