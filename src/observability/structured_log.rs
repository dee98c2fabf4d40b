/// 構造化JSON形式ログ。
use serde_json::{Map, Value, json};
use tracing::{Event, Level, Subscriber, field::Field, field::Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

const FIELD_PREFIX: &str = "sentiment.";

/// `sentiment.*` フィールドを持つイベントだけを 1 行 JSON で出すレイヤー。
pub(crate) struct StructuredLogLayer;

#[derive(Default)]
struct SentimentFieldVisitor {
    message: Option<String>,
    values: Map<String, Value>,
}

impl SentimentFieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if let Some(name) = field.name().strip_prefix(FIELD_PREFIX) {
            self.values.insert(name.to_string(), value);
        }
    }
}

impl Visit for SentimentFieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
            return;
        }
        self.insert(field, json!(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }
}

fn render_entry(level: &Level, target: &str, visitor: SentimentFieldVisitor) -> Option<Value> {
    if visitor.values.is_empty() || *level > Level::INFO {
        return None;
    }
    Some(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "level": level.as_str(),
        "target": target,
        "message": visitor.message.unwrap_or_default(),
        "sentiment": visitor.values,
    }))
}

impl<S: Subscriber> Layer<S> for StructuredLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = SentimentFieldVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        if let Some(entry) = render_entry(metadata.level(), metadata.target(), visitor) {
            eprintln!("{}", serde_json::to_string(&entry).unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visitor_with(fields: &[(&str, Value)]) -> SentimentFieldVisitor {
        let mut visitor = SentimentFieldVisitor {
            message: Some("run finished".to_string()),
            ..SentimentFieldVisitor::default()
        };
        for (name, value) in fields {
            visitor.values.insert((*name).to_string(), value.clone());
        }
        visitor
    }

    #[test]
    fn events_without_sentiment_fields_are_dropped() {
        assert!(render_entry(&Level::INFO, "sentiment_worker", visitor_with(&[])).is_none());
    }

    #[test]
    fn debug_events_are_dropped() {
        let visitor = visitor_with(&[("run_id", json!("abc"))]);
        assert!(render_entry(&Level::DEBUG, "sentiment_worker", visitor).is_none());
    }

    #[test]
    fn entry_nests_sentiment_fields() {
        let visitor = visitor_with(&[("classified", json!(3))]);
        let entry = render_entry(&Level::WARN, "sentiment_worker::pipeline", visitor).unwrap();

        assert_eq!(entry["level"], "WARN");
        assert_eq!(entry["message"], "run finished");
        assert_eq!(entry["sentiment"]["classified"], 3);
    }
}
