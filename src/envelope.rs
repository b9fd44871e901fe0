use std::{fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open mapping of request data threaded between steps (url, sql, payload...).
pub type MessageBody = serde_json::Map<String, Value>;

/// Well-known message body keys.
pub mod keys {
    pub const COMMAND: &str = "command";
    pub const RULE_CODE: &str = "rule_code";
    pub const RULE_NAME: &str = "rule_name";
    pub const RULE_DESCRIPTION: &str = "rule_description";
    pub const RULE_TEXT: &str = "rule_text";
    pub const SQL: &str = "sql";
    pub const TABLE_NAME: &str = "table_name";
    pub const ROW_COUNT: &str = "row_count";
    pub const RULE_ID: &str = "rule_id";
    pub const VIEW_ID: &str = "view_id";
    pub const URL: &str = "url";
    pub const STATUS_CODE: &str = "status_code";
    pub const PAGE_TEXT: &str = "page_text";
    pub const PAYLOAD: &str = "payload";
    pub const PAYLOAD_VERIFIED: &str = "payload_verified";
    pub const VIOLATIONS: &str = "violations";
    pub const STATUS: &str = "status";
    pub const DETAIL: &str = "detail";
}

/// Which of the two flows a request belongs to. Fixed for the life of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowKind {
    Rule,
    Content,
}

impl FlowKind {
    pub const ALL: [FlowKind; 2] = [FlowKind::Rule, FlowKind::Content];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Rule => "RULE",
            FlowKind::Content => "CONTENT",
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RULE" => Ok(FlowKind::Rule),
            "CONTENT" => Ok(FlowKind::Content),
            other => Err(format!("unknown flow kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Yes,
    No,
    #[default]
    Pending,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Yes => "yes",
            Decision::No => "no",
            Decision::Pending => "pending",
        };
        f.write_str(s)
    }
}

/// A change a step asks the supervisor to make to the message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Set { key: String, value: Value },
    Remove { key: String },
}

impl Mutation {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Mutation::Set { key: key.into(), value: value.into() }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Mutation::Remove { key: key.into() }
    }
}

/// Per-request flow state.
///
/// Envelopes are values: every transition produces a new envelope and leaves
/// the previous one untouched, so a run can be replayed from its records.
/// The flow kind and verb are set at construction and have no setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    #[serde(rename = "type")]
    flow_kind: FlowKind,
    verb: String,
    decision: Decision,
    confidence: f64,
    reason: String,
    #[serde(rename = "nextAgent")]
    next_step: String,
    #[serde(rename = "messageBody")]
    message_body: MessageBody,
}

impl Envelope {
    pub fn new(flow_kind: FlowKind, verb: impl Into<String>, next_step: impl Into<String>, message_body: MessageBody) -> Self {
        Self {
            flow_kind,
            verb: verb.into(),
            decision: Decision::Pending,
            confidence: 0.0,
            reason: String::new(),
            next_step: next_step.into(),
            message_body,
        }
    }

    pub fn flow_kind(&self) -> FlowKind {
        self.flow_kind
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn next_step(&self) -> &str {
        &self.next_step
    }

    pub fn message_body(&self) -> &MessageBody {
        &self.message_body
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.message_body.get(key)
    }

    /// New envelope carrying a step's verdict with `mutations` applied in order.
    pub fn with_outcome(&self, decision: Decision, confidence: f64, reason: impl Into<String>, mutations: &[Mutation]) -> Self {
        let mut message_body = self.message_body.clone();
        for mutation in mutations {
            match mutation {
                Mutation::Set { key, value } => {
                    message_body.insert(key.clone(), value.clone());
                }
                Mutation::Remove { key } => {
                    message_body.remove(key);
                }
            }
        }

        Self {
            flow_kind: self.flow_kind,
            verb: self.verb.clone(),
            decision,
            confidence: clamp_confidence(confidence),
            reason: reason.into(),
            next_step: self.next_step.clone(),
            message_body,
        }
    }

    pub fn routed_to(&self, next_step: impl Into<String>) -> Self {
        Self { next_step: next_step.into(), ..self.clone() }
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> MessageBody {
        let mut body = MessageBody::new();
        body.insert("url".into(), json!("https://example.com/a"));
        body
    }

    #[test]
    fn test_outcome_leaves_original_untouched() {
        let env = Envelope::new(FlowKind::Content, "ingest", "verify_request", body());
        let next = env.with_outcome(
            Decision::Yes,
            0.9,
            "ok",
            &[Mutation::set("page_text", "hello"), Mutation::remove("url")],
        );

        assert_eq!(env.decision(), Decision::Pending);
        assert!(env.get("url").is_some());
        assert!(env.get("page_text").is_none());

        assert_eq!(next.decision(), Decision::Yes);
        assert_eq!(next.get("page_text"), Some(&json!("hello")));
        assert!(next.get("url").is_none());
        assert_eq!(next.flow_kind(), FlowKind::Content);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let env = Envelope::new(FlowKind::Rule, "compile", "verify_request", MessageBody::new());
        assert_eq!(env.with_outcome(Decision::Yes, 7.0, "", &[]).confidence(), 1.0);
        assert_eq!(env.with_outcome(Decision::No, -1.0, "", &[]).confidence(), 0.0);
        assert_eq!(env.with_outcome(Decision::No, f64::NAN, "", &[]).confidence(), 0.0);
    }

    #[test]
    fn test_wire_shape() {
        let env = Envelope::new(FlowKind::Rule, "compile", "verify_request", body()).routed_to("generate_sql");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], json!("RULE"));
        assert_eq!(value["verb"], json!("compile"));
        assert_eq!(value["decision"], json!("pending"));
        assert_eq!(value["nextAgent"], json!("generate_sql"));
        assert_eq!(value["messageBody"]["url"], json!("https://example.com/a"));

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_flow_kind_parse() {
        assert_eq!("rule".parse::<FlowKind>().unwrap(), FlowKind::Rule);
        assert_eq!(" CONTENT ".parse::<FlowKind>().unwrap(), FlowKind::Content);
        assert!("other".parse::<FlowKind>().is_err());
    }
}
