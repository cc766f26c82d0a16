//! Human-readable rendering for events and errors, used by the stdout sink
//! and by CLI/test harnesses. Color mode can be forced for log files or
//! auto-detected from the stderr TTY.

use std::io::IsTerminal;

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::LadderError;
use crate::events::Event;

pub const CONTEXT_COLOR: &str = "\x1b[32m";
pub const LINE_COLOR: &str = "\x1b[35m";
pub const RESET_COLOR: &str = "\x1b[0m";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatterMode {
    Auto,
    Colored,
    Plain,
}

impl FormatterMode {
    fn colored(self) -> bool {
        match self {
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
            FormatterMode::Auto => std::io::stderr().is_terminal(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_error(&self, error: &LadderError) -> EventRender;
}

pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }
}

fn format_error_chain(error: &LadderError, indent: usize, colored: bool) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(cause) = &error.cause {
        let indent_str = "  ".repeat(indent);
        if colored {
            lines.push(format!(
                "{LINE_COLOR}{indent_str}cause: {}{RESET_COLOR}\n",
                cause.message
            ));
        } else {
            lines.push(format!("{indent_str}cause: {}\n", cause.message));
        }
        lines.extend(format_error_chain(cause, indent + 1, colored));
    }
    lines
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let colored = self.mode.colored();
        let line = if colored {
            format!("{LINE_COLOR}{event}{RESET_COLOR}\n")
        } else {
            format!("{event}\n")
        };
        EventRender {
            context: Some(event.scope_label().to_string()),
            lines: vec![line],
        }
    }

    fn render_error(&self, error: &LadderError) -> EventRender {
        let colored = self.mode.colored();
        let mut lines = vec![if colored {
            format!("{LINE_COLOR}error: {}{RESET_COLOR}\n", error.message)
        } else {
            format!("error: {}\n", error.message)
        }];
        lines.extend(format_error_chain(error, 1, colored));
        EventRender {
            context: None,
            lines,
        }
    }
}

pub fn pretty_print_with_mode(events: &[Event], mode: FormatterMode) -> String {
    let formatter = PlainFormatter::with_mode(mode);
    events
        .iter()
        .map(|e| formatter.render_event(e).join_lines())
        .collect::<Vec<_>>()
        .join("")
}

pub fn pretty_print(events: &[Event]) -> String {
    pretty_print_with_mode(events, FormatterMode::Auto)
}

/// Installs a `tracing_subscriber::registry()` with an `EnvFilter`, a plain
/// `fmt` layer, and `tracing_error::ErrorLayer` so `SpanTrace::capture()`
/// inside an instrumented span picks up the active span stack. Meant to be
/// called once by an embedding binary or example, not by this library.
pub fn init_tracing(default_directive: &str) {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap_or_else(|_| "info".parse().unwrap())))
        .with(ErrorLayer::default())
        .try_init();
}
