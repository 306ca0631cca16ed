//! Console log format for the peer-mesh binary.
//!
//! Lines read `[timestamp] [origin] [level] message key=value ...`. The origin
//! column names the layer that logged: an explicit `component` field wins,
//! otherwise the emitting crate is used, so `mesh_session` shows up as
//! `mesh-session` and the binary itself as plain `mesh`.

use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const ORIGIN_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 9;

/// Prefix shared by the library crates of the workspace
const LAYER_PREFIX: &str = "mesh_";

/// Formatter for the binary's stderr log
pub struct MeshLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with a `component` field, shown in place of the crate name
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl MeshLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Origin column for an event from `target`.
    fn origin(&self, component: Option<&str>, target: &str) -> String {
        let name = match component.or_else(|| layer_of(target)) {
            Some(layer) => format!("{}-{}", self.service_name, layer),
            None => self.service_name.clone(),
        };
        fit(&name, ORIGIN_WIDTH)
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }
}

/// Mesh layer of a tracing target such as `mesh_overlay::node`.
fn layer_of(target: &str) -> Option<&str> {
    let krate = target.split("::").next()?;
    krate.strip_prefix(LAYER_PREFIX).filter(|layer| !layer.is_empty())
}

/// Pad or truncate `name` to exactly `width` characters.
fn fit(name: &str, width: usize) -> String {
    if name.chars().count() > width {
        let truncated: String = name.chars().take(width - 1).collect();
        format!("{}…", truncated)
    } else {
        format!("{:<width$}", name, width = width)
    }
}

/// Label and color of a level
fn level_style(level: &Level) -> (&'static str, &'static str) {
    match *level {
        Level::ERROR => ("✗ ERROR", COLOR_BRIGHT_RED),
        Level::WARN => ("⚠ WARN", COLOR_BRIGHT_YELLOW),
        Level::INFO => ("ℹ INFO", COLOR_GREEN),
        Level::DEBUG => ("◦ DEBUG", COLOR_BRIGHT_GRAY),
        Level::TRACE => ("◦ TRACE", COLOR_BRIGHT_GRAY),
    }
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
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

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let origin = self.origin(fields.component.as_deref(), metadata.target());
        let (label, color) = level_style(metadata.level());
        let reset = self.paint(COLOR_RESET);

        write!(
            writer,
            "{}[{}] [{}] [{}{:<width$}{}] ",
            self.paint(COLOR_CYAN),
            timestamp,
            origin,
            self.paint(color),
            label,
            reset,
            width = LEVEL_WIDTH
        )?;
        writeln!(writer, "{}{}", fields.render(), reset)
    }
}

/// Collects the message, the `component` override and any other fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl FieldVisitor {
    fn record(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => self.extra.push((name, value)),
        }
    }

    /// Message followed by the remaining fields as `key=value`
    fn render(&self) -> String {
        let mut line = self.message.clone();
        for (key, value) in &self.extra {
            line.push_str(&format!(" {}={}", key, value));
        }
        line
    }
}

fn strip_quotes(s: String) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.record(field.name(), strip_quotes(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record(field.name(), value.to_string());
    }
}

/// Whether stdout is a terminal that understands colors
fn is_terminal() -> bool {
    use std::io::IsTerminal;
    std::env::var("TERM").map(|t| t != "dumb").unwrap_or(false) && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> MeshLogFormatter {
        MeshLogFormatter {
            service_name: "mesh".to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_origin_from_crate() {
        let formatter = plain();
        assert_eq!(formatter.origin(None, "mesh_session::multiplexer"), fit("mesh-session", 16));
        assert_eq!(formatter.origin(None, "mesh_relay"), fit("mesh-relay", 16));
        assert_eq!(formatter.origin(None, "peer_mesh"), fit("mesh", 16));
        assert_eq!(formatter.origin(None, "mesh_"), fit("mesh", 16));
    }

    #[test]
    fn test_component_overrides_crate() {
        let formatter = plain();
        assert_eq!(formatter.origin(Some("client"), "peer_mesh"), fit("mesh-client", 16));
        assert_eq!(formatter.origin(Some("relay"), "mesh_overlay::mesh"), fit("mesh-relay", 16));
    }

    #[test]
    fn test_fit_truncates_by_char() {
        assert_eq!(fit("mesh", 6), "mesh  ");
        let long = fit("mesh-a-very-long-component", ORIGIN_WIDTH);
        assert_eq!(long.chars().count(), ORIGIN_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_plain_output_has_no_color() {
        let formatter = plain();
        let (label, color) = level_style(&Level::WARN);
        assert_eq!(label, "⚠ WARN");
        assert_eq!(formatter.paint(color), "");
    }

    #[test]
    fn test_extra_fields_follow_message() {
        let mut fields = FieldVisitor::default();
        fields.record("message", "Relay connection open".to_string());
        fields.record("component", "relay".to_string());
        fields.record("room", "lobby".to_string());
        fields.record("members", "2".to_string());
        assert_eq!(fields.component.as_deref(), Some("relay"));
        assert_eq!(fields.render(), "Relay connection open room=lobby members=2");
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"relay\"".to_string()), "relay");
        assert_eq!(strip_quotes("\"".to_string()), "\"");
        assert_eq!(strip_quotes("plain".to_string()), "plain");
    }
}
