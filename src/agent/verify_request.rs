use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::{
    envelope::{FlowKind, MessageBody, Mutation, keys},
    error::{StepError, ValidationError, ViolationKind},
    step::{Step, StepOutcome},
};

static URL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("url pattern compiles"));

/// Lowercase snake case, short enough that `rule_<code>` is still a SQLite identifier.
static RULE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,57}$").expect("rule code pattern compiles"));

/// Rule codes map one-to-one onto view names, so only one spelling is accepted.
pub fn is_rule_code(code: &str) -> bool {
    RULE_CODE.is_match(code)
}

fn text_field<'a>(body: &'a MessageBody, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

/// Checks that the request carries a usable target for its flow kind and
/// returns the normalizing mutations to apply.
pub fn verify_request(flow_kind: FlowKind, body: &MessageBody) -> Result<Vec<Mutation>, ValidationError> {
    match flow_kind {
        FlowKind::Rule => verify_rule_request(body),
        FlowKind::Content => verify_content_request(body),
    }
}

fn verify_rule_request(body: &MessageBody) -> Result<Vec<Mutation>, ValidationError> {
    let mut err = ValidationError::default();
    let mut mutations = vec![];

    let text = text_field(body, keys::RULE_TEXT).or_else(|| text_field(body, keys::COMMAND));
    match text {
        Some(text) => mutations.push(Mutation::set(keys::RULE_TEXT, text)),
        None => err.push(ViolationKind::Request, "no rule text found"),
    }

    match text_field(body, keys::RULE_CODE) {
        Some(code) if is_rule_code(code) => {
            mutations.push(Mutation::set(keys::RULE_CODE, code));
            if text_field(body, keys::RULE_NAME).is_none() {
                mutations.push(Mutation::set(keys::RULE_NAME, code));
            }
        }
        Some(code) => err.push(
            ViolationKind::Request,
            format!("rule code `{code}` must start with a lowercase letter and contain only `a-z`, `0-9` or `_`"),
        ),
        None => err.push(ViolationKind::Request, "no rule code found"),
    }

    err.into_result().map(|_| mutations)
}

fn verify_content_request(body: &MessageBody) -> Result<Vec<Mutation>, ValidationError> {
    let candidate = text_field(body, keys::URL).map(str::to_string).or_else(|| {
        text_field(body, keys::COMMAND)
            .and_then(|cmd| URL_IN_TEXT.find(cmd))
            .map(|m| m.as_str().trim_end_matches(['.', ',', ')', ';']).to_string())
    });

    let Some(candidate) = candidate else {
        return Err(ValidationError::single(ViolationKind::Request, "no URL found"));
    };

    let url = Url::parse(&candidate)
        .map_err(|e| ValidationError::single(ViolationKind::Request, format!("invalid URL `{candidate}`: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::single(
            ViolationKind::Request,
            format!("unsupported URL scheme `{}`", url.scheme()),
        ));
    }
    if url.host_str().is_none() {
        return Err(ValidationError::single(ViolationKind::Request, format!("URL `{candidate}` has no host")));
    }

    Ok(vec![Mutation::set(keys::URL, url.as_str())])
}

#[derive(Debug, Default, Clone)]
pub struct VerifyRequest;

impl VerifyRequest {
    pub const NAME: &'static str = "verify_request";
}

#[async_trait]
impl Step for VerifyRequest {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process(&self, body: &MessageBody, flow_kind: FlowKind) -> Result<StepOutcome, StepError> {
        Ok(match verify_request(flow_kind, body) {
            Ok(mutations) => {
                let target = match flow_kind {
                    FlowKind::Rule => "rule text",
                    FlowKind::Content => "URL",
                };
                StepOutcome::yes(format!("request carries a valid {target}")).with_mutations(mutations)
            }
            Err(err) => super::rejected(&err),
        })
    }
}
