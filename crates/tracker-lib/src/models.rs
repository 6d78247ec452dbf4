//! Core data models for tracked learning activity
//!
//! The pipeline treats every buffered entry as an opaque [`Record`] that can
//! render itself two ways: as a structured statement for the primary
//! collector and as flat column/value pairs for CSV backup rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// A unit of tracked activity accepted by the pipeline
pub trait Record: Send + Sync + 'static {
    /// Structured form sent to the primary collector
    fn to_statement(&self) -> Value;

    /// Ordered flat column/value pairs used for CSV backup rows
    fn csv_fields(&self) -> Vec<(String, String)>;
}

/// Identity of the learner producing statements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    /// Account home page, e.g. the LMS base URL
    pub home_page: String,
}

impl Actor {
    pub fn new(name: impl Into<String>, home_page: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            home_page: home_page.into(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "objectType": "Agent",
            "name": self.name,
            "account": {
                "name": self.name,
                "homePage": self.home_page,
            }
        })
    }
}

/// Optional outcome fields of a statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub score: Option<f64>,
    pub success: Option<bool>,
    pub completion: Option<bool>,
    pub duration: Option<Duration>,
    pub response: Option<String>,
    pub extensions: Map<String, Value>,
}

impl StatementResult {
    fn is_empty(&self) -> bool {
        self.score.is_none()
            && self.success.is_none()
            && self.completion.is_none()
            && self.duration.is_none()
            && self.response.is_none()
            && self.extensions.is_empty()
    }

    fn to_json(&self, uri_prefix: &str) -> Value {
        let mut result = Map::new();
        if let Some(score) = self.score {
            result.insert("score".to_string(), json!({ "raw": score }));
        }
        if let Some(success) = self.success {
            result.insert("success".to_string(), Value::Bool(success));
        }
        if let Some(completion) = self.completion {
            result.insert("completion".to_string(), Value::Bool(completion));
        }
        if let Some(duration) = self.duration {
            result.insert("duration".to_string(), Value::String(iso8601_duration(duration)));
        }
        if let Some(response) = &self.response {
            result.insert("response".to_string(), Value::String(response.clone()));
        }
        if !self.extensions.is_empty() {
            let extensions: Map<String, Value> = self
                .extensions
                .iter()
                .map(|(key, value)| (resolve_uri(uri_prefix, key), value.clone()))
                .collect();
            result.insert("extensions".to_string(), Value::Object(extensions));
        }
        Value::Object(result)
    }
}

/// A single activity statement: who did what to which object, and how it went
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: Uuid,
    pub actor: Actor,
    pub verb: String,
    pub object_type: String,
    pub object_id: String,
    pub result: StatementResult,
    /// Session or category identifier
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Prefix applied to non-absolute identifiers when rendering
    pub uri_prefix: String,
}

impl Statement {
    pub fn score(mut self, score: f64) -> Self {
        self.result.score = Some(score);
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.result.success = Some(success);
        self
    }

    pub fn completion(mut self, completion: bool) -> Self {
        self.result.completion = Some(completion);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.result.duration = Some(duration);
        self
    }

    pub fn response(mut self, response: impl Into<String>) -> Self {
        self.result.response = Some(response.into());
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.result.extensions.insert(key.into(), value.into());
        self
    }

    pub fn context(mut self, session: impl Into<String>) -> Self {
        self.context = Some(session.into());
        self
    }
}

impl Record for Statement {
    fn to_statement(&self) -> Value {
        let prefix = self.uri_prefix.as_str();
        let mut statement = json!({
            "id": self.id.to_string(),
            "actor": self.actor.to_json(),
            "verb": {
                "id": resolve_uri(prefix, &self.verb),
                "display": { "en-US": self.verb },
            },
            "object": {
                "objectType": "Activity",
                "id": resolve_uri(prefix, &self.object_id),
                "definition": { "type": resolve_uri(prefix, &self.object_type) },
            },
            "timestamp": self.timestamp.to_rfc3339(),
        });

        if let Value::Object(map) = &mut statement {
            if !self.result.is_empty() {
                map.insert("result".to_string(), self.result.to_json(prefix));
            }
            if let Some(session) = &self.context {
                let mut extensions = Map::new();
                extensions.insert(resolve_uri(prefix, "session"), Value::String(session.clone()));
                map.insert(
                    "context".to_string(),
                    json!({ "extensions": Value::Object(extensions) }),
                );
            }
        }

        statement
    }

    fn csv_fields(&self) -> Vec<(String, String)> {
        let optional = |value: Option<String>| value.unwrap_or_default();
        let mut fields = vec![
            ("id".to_string(), self.id.to_string()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
            ("actor".to_string(), self.actor.name.clone()),
            ("verb".to_string(), self.verb.clone()),
            ("object_type".to_string(), self.object_type.clone()),
            ("object_id".to_string(), self.object_id.clone()),
            ("score".to_string(), optional(self.result.score.map(|s| s.to_string()))),
            ("success".to_string(), optional(self.result.success.map(|s| s.to_string()))),
            (
                "completion".to_string(),
                optional(self.result.completion.map(|c| c.to_string())),
            ),
            (
                "duration".to_string(),
                optional(self.result.duration.map(iso8601_duration)),
            ),
            ("response".to_string(), optional(self.result.response.clone())),
            ("context".to_string(), optional(self.context.clone())),
        ];

        // Nested extension values have no flat representation and are left out
        for (key, value) in &self.result.extensions {
            let flat = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => continue,
            };
            fields.push((format!("ext.{key}"), flat));
        }

        fields
    }
}

/// Creates statements for a fixed actor and identifier prefix
#[derive(Debug, Clone)]
pub struct StatementFactory {
    actor: Actor,
    uri_prefix: String,
}

impl StatementFactory {
    pub fn new(actor: Actor, uri_prefix: impl Into<String>) -> Self {
        Self {
            actor,
            uri_prefix: uri_prefix.into(),
        }
    }

    /// Create a statement with a fresh id and the current timestamp
    pub fn create(
        &self,
        verb: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Statement {
        Statement {
            id: Uuid::new_v4(),
            actor: self.actor.clone(),
            verb: verb.into(),
            object_type: object_type.into(),
            object_id: object_id.into(),
            result: StatementResult::default(),
            context: None,
            timestamp: Utc::now(),
            uri_prefix: self.uri_prefix.clone(),
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }
}

/// Resolve an identifier against a prefix unless it is already an absolute URL
pub fn resolve_uri(prefix: &str, id: &str) -> String {
    if url::Url::parse(id).is_ok() {
        return id.to_string();
    }
    match (prefix.ends_with('/'), id.starts_with('/')) {
        (true, true) => format!("{}{}", prefix, &id[1..]),
        (false, false) => format!("{prefix}/{id}"),
        _ => format!("{prefix}{id}"),
    }
}

/// Format a duration as an ISO-8601 `PT..S` value
pub fn iso8601_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        format!("PT{}S", millis / 1000)
    } else {
        format!("PT{}.{:03}S", millis / 1000, millis % 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> StatementFactory {
        StatementFactory::new(
            Actor::new("learner-1", "https://lms.example.org"),
            "https://example.org/xapi/",
        )
    }

    #[test]
    fn test_resolve_uri() {
        let prefix = "https://example.org/xapi/";
        assert_eq!(resolve_uri(prefix, "completed"), "https://example.org/xapi/completed");
        assert_eq!(resolve_uri(prefix, "/completed"), "https://example.org/xapi/completed");
        assert_eq!(
            resolve_uri("https://example.org/xapi", "completed"),
            "https://example.org/xapi/completed"
        );
        assert_eq!(
            resolve_uri(prefix, "http://adlnet.gov/expapi/verbs/completed"),
            "http://adlnet.gov/expapi/verbs/completed"
        );
    }

    #[test]
    fn test_iso8601_duration() {
        assert_eq!(iso8601_duration(Duration::from_secs(90)), "PT90S");
        assert_eq!(iso8601_duration(Duration::from_millis(1500)), "PT1.500S");
    }

    #[test]
    fn test_factory_assigns_unique_ids() {
        let factory = factory();
        let a = factory.create("initialized", "level", "level-1");
        let b = factory.create("initialized", "level", "level-1");
        assert_ne!(a.id, b.id);
        assert_eq!(factory.actor().name, "learner-1");
    }

    #[test]
    fn test_statement_rendering() {
        let statement = factory()
            .create("completed", "level", "level-1")
            .score(0.75)
            .success(true)
            .duration(Duration::from_secs(42))
            .extension("attempts", 3)
            .context("session-9");

        let json = statement.to_statement();
        assert_eq!(json["id"], statement.id.to_string());
        assert_eq!(json["actor"]["name"], "learner-1");
        assert_eq!(json["verb"]["id"], "https://example.org/xapi/completed");
        assert_eq!(json["verb"]["display"]["en-US"], "completed");
        assert_eq!(json["object"]["id"], "https://example.org/xapi/level-1");
        assert_eq!(
            json["object"]["definition"]["type"],
            "https://example.org/xapi/level"
        );
        assert_eq!(json["result"]["score"]["raw"], 0.75);
        assert_eq!(json["result"]["success"], true);
        assert_eq!(json["result"]["duration"], "PT42S");
        assert_eq!(
            json["result"]["extensions"]["https://example.org/xapi/attempts"],
            3
        );
        assert_eq!(
            json["context"]["extensions"]["https://example.org/xapi/session"],
            "session-9"
        );
    }

    #[test]
    fn test_statement_without_result_omits_result() {
        let json = factory().create("launched", "game", "game-1").to_statement();
        assert!(json.get("result").is_none());
        assert!(json.get("context").is_none());
    }

    #[test]
    fn test_csv_fields_drop_nested_extensions() {
        let statement = factory()
            .create("answered", "question", "q-1")
            .response("b")
            .extension("choice", "b")
            .extension("weights", serde_json::json!({ "a": 1 }))
            .extension("tags", serde_json::json!(["x", "y"]));

        let fields = statement.csv_fields();
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };

        assert_eq!(lookup("verb").as_deref(), Some("answered"));
        assert_eq!(lookup("response").as_deref(), Some("b"));
        assert_eq!(lookup("score").as_deref(), Some(""));
        assert_eq!(lookup("ext.choice").as_deref(), Some("b"));
        assert!(lookup("ext.weights").is_none());
        assert!(lookup("ext.tags").is_none());
    }
}
