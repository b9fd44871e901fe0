use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::{
    agent::Denylist,
    envelope::{FlowKind, MessageBody, Mutation, keys},
    error::{StepError, ValidationError, ViolationKind},
    step::{Step, StepOutcome},
};

static READ_ONLY_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(select|with)\b").expect("read-only prefix pattern compiles"));

/// Accepts one read-only statement and returns it without the optional
/// trailing terminator.
pub fn verify_sql(sql: &str, denylist: &Denylist) -> Result<String, ValidationError> {
    let mut err = ValidationError::default();

    let trimmed = sql.trim();
    let statement = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();

    if statement.is_empty() {
        return Err(ValidationError::single(ViolationKind::Request, "generated SQL is empty"));
    }
    if !READ_ONLY_START.is_match(statement) {
        err.push(ViolationKind::Safety, "SQL must start with SELECT or WITH");
    }
    if statement.contains(';') {
        err.push(ViolationKind::Safety, "SQL must be a single statement");
    }
    if statement.contains("--") || statement.contains("/*") {
        err.push(ViolationKind::Safety, "SQL must not contain comments");
    }
    if let Some(pattern) = denylist.find(sql) {
        err.push(ViolationKind::Safety, format!("SQL matches denylist pattern `{pattern}`"));
    }

    err.into_result().map(|_| statement.to_string())
}

#[derive(Debug, Clone)]
pub struct VerifySql {
    denylist: Arc<Denylist>,
}

impl VerifySql {
    pub const NAME: &'static str = "verify_sql";

    pub fn new(denylist: Arc<Denylist>) -> Self {
        Self { denylist }
    }
}

#[async_trait]
impl Step for VerifySql {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process(&self, body: &MessageBody, _flow_kind: FlowKind) -> Result<StepOutcome, StepError> {
        let sql = body.get(keys::SQL).and_then(Value::as_str).unwrap_or_default();
        Ok(match verify_sql(sql, &self.denylist) {
            Ok(statement) => StepOutcome::yes("SQL is a single read-only statement")
                .with_mutation(Mutation::set(keys::SQL, statement)),
            Err(err) => super::rejected(&err),
        })
    }
}
