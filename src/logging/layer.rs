//! `tracing_subscriber` layer forwarding events into a [`LogSink`].

use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{LogSeverity, LogSink};

const CRATE_PREFIX: &str = "twitchsub::";

/// Copies INFO, WARN and ERROR events into a [`LogSink`].
#[derive(Clone)]
pub struct LogSinkLayer {
    sink: LogSink,
}

impl LogSinkLayer {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

/// Log source for an event target: the first module below the crate root
/// (`twitchsub::ws::client` → `ws`), or the first path segment otherwise.
pub fn source_for_target(target: &str) -> &str {
    let rest = target.strip_prefix(CRATE_PREFIX).unwrap_or(target);
    rest.split("::").next().unwrap_or(rest)
}

impl<S: Subscriber> Layer<S> for LogSinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let severity = match *metadata.level() {
            Level::ERROR => LogSeverity::Error,
            Level::WARN => LogSeverity::Warning,
            Level::INFO => LogSeverity::Info,
            _ => return,
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink
            .add_log(source_for_target(metadata.target()), visitor.finish(), severity);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn source_is_first_module() {
        assert_eq!(source_for_target("twitchsub::ws::client"), "ws");
        assert_eq!(source_for_target("twitchsub::net"), "net");
        assert_eq!(source_for_target("redemptions"), "redemptions");
        assert_eq!(source_for_target("rustls::client::hs"), "rustls");
    }

    #[test]
    fn captures_info_and_above_with_fields() {
        let sink = LogSink::new();
        let subscriber = tracing_subscriber::registry().with(LogSinkLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "twitchsub::net::registry", socket = "client", bytes = 12, "sent");
            tracing::warn!(target: "twitchsub::net::registry", "slow peer");
            tracing::debug!(target: "twitchsub::net::registry", "not captured");
        });

        let entries = sink.get_log("net");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "sent socket=client bytes=12");
        assert_eq!(entries[0].severity, LogSeverity::Info);
        assert_eq!(entries[1].severity, LogSeverity::Warning);
    }
}
