//! Console log format for the update tool.
//!
//! Lines look like
//! `[2026-10-19 12:00:00.000] [fwup-transfer   ] [◦ DEBUG] Frame written  chunk=3 frame=12 ack=Some(Accept)`.
//! The component column comes from an explicit `component` field or from the
//! crate that emitted the event; every other structured field is appended as
//! `key=value` so chunk, frame and reject counts stay visible.

use std::fmt;
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 7;

/// Event formatter for `fwup`
pub struct FwupLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with an explicit component column
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl FwupLogFormatter {
    pub fn new(service_name: String) -> Self {
        Self {
            service_name,
            color_enabled: is_terminal(),
        }
    }

    /// `fwup_transfer::session` -> `transfer`, `fwup::config` -> `config`
    fn component_from_target<'a>(&self, target: &'a str) -> Option<&'a str> {
        let mut parts = target.split("::");
        let krate = parts.next()?;
        match krate.strip_prefix("fwup_") {
            Some(lib) => Some(lib),
            None if krate == self.service_name => parts.next(),
            None => None,
        }
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_label(level: &Level) -> &'static str {
        match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        }
    }

    fn color(&self, code: &'static str) -> &'static str {
        if self.color_enabled {
            code
        } else {
            ""
        }
    }

    fn level_color(&self, level: &Level) -> &'static str {
        self.color(match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        })
    }
}

impl<S, N> FormatEvent<S, N> for FwupLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let component = visitor
            .component
            .as_deref()
            .or_else(|| self.component_from_target(metadata.target()));
        let reset = self.color(COLOR_RESET);

        write!(
            writer,
            "{}[{}] [{}] [{}{:<width$}{}] {}",
            self.color(COLOR_CYAN),
            timestamp,
            self.format_component(component),
            self.level_color(level),
            Self::level_label(level),
            reset,
            visitor.message,
            width = LOG_LEVEL_WIDTH
        )?;

        if !visitor.fields.is_empty() {
            write!(writer, " {}", self.color(COLOR_BRIGHT_GRAY))?;
            for (name, value) in &visitor.fields {
                write!(writer, " {}={}", name, value)?;
            }
        }

        writeln!(writer, "{}", reset)
    }
}

/// Splits an event into message, component and remaining fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            name => self.fields.push((name, value)),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value.to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }
}

fn is_terminal() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn plain() -> FwupLogFormatter {
        FwupLogFormatter {
            service_name: "fwup".to_string(),
            color_enabled: false,
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(emit: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .event_format(plain())
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, emit);
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_component_column() {
        let formatter = plain();
        assert_eq!(formatter.format_component(None), format!("{:<16}", "fwup"));
        assert_eq!(
            formatter.format_component(Some("update")),
            format!("{:<16}", "fwup-update")
        );
        assert_eq!(
            formatter.format_component(Some("a-very-long-component")),
            "fwup-a-very-lon…"
        );
    }

    #[test]
    fn test_component_from_target() {
        let formatter = plain();
        assert_eq!(
            formatter.component_from_target("fwup_transfer::session"),
            Some("transfer")
        );
        assert_eq!(formatter.component_from_target("fwup_bundle"), Some("bundle"));
        assert_eq!(formatter.component_from_target("fwup::config"), Some("config"));
        assert_eq!(formatter.component_from_target("fwup"), None);
        assert_eq!(formatter.component_from_target("tokio::runtime"), None);
    }

    #[test]
    fn test_transfer_fields_are_rendered() {
        let line = capture(|| {
            tracing::debug!(
                target: "fwup_transfer::retry",
                chunk = 3i16,
                frame = 12usize,
                rejects = 2u32,
                "Frame rejected, resending"
            );
        });

        assert!(line.contains("[fwup-transfer   ]"), "{}", line);
        assert!(line.contains("◦ DEBUG"), "{}", line);
        assert!(
            line.trim_end()
                .ends_with("Frame rejected, resending  chunk=3 frame=12 rejects=2"),
            "{}",
            line
        );
        assert!(!line.contains('\x1b'));
    }

    #[test]
    fn test_explicit_component_wins() {
        let line = capture(|| {
            component_info!("update", "Update complete");
        });
        assert!(line.contains("[fwup-update     ]"), "{}", line);
        assert!(line.trim_end().ends_with("Update complete"), "{}", line);
    }
}
