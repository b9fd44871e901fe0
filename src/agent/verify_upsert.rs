use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use crate::{
    agent::Denylist,
    envelope::{FlowKind, MessageBody, Mutation, keys},
    error::{StepError, ValidationError, ViolationKind},
    payload::{ENTITY_COLLECTIONS, ExtractedEntityPayload, LINK_COLLECTIONS, PatternKind, link_target, optional_text_fields},
    step::{Step, StepOutcome},
};

/// Verify an untrusted extraction.
///
/// Runs every check (structure, required fields, references, denylist, dates and
/// source agreement) and reports all violations together. On success the
/// typed payload is returned; the raw value is left as it was.
pub fn verify_upsert(raw: &Value, denylist: &Denylist) -> Result<ExtractedEntityPayload, ValidationError> {
    let mut err = ValidationError::default();

    let Some(object) = raw.as_object() else {
        err.push(ViolationKind::Structural, format!("payload must be an object, got {}", type_name(raw)));
        return Err(err);
    };

    let empty: Vec<Value> = Vec::new();
    let mut collections: HashMap<&str, &Vec<Value>> = HashMap::new();
    for key in ENTITY_COLLECTIONS.into_iter().chain(LINK_COLLECTIONS) {
        match object.get(key) {
            None | Some(Value::Null) => {
                collections.insert(key, &empty);
            }
            Some(Value::Array(items)) => {
                collections.insert(key, items);
            }
            Some(other) => {
                err.push(
                    ViolationKind::Structural,
                    format!("`{key}` must be a list, got {}", type_name(other)),
                );
                collections.insert(key, &empty);
            }
        }
    }

    let names = check_entities(&collections, &mut err);
    check_links(&collections, &names, &mut err);
    check_denylist(raw, "", denylist, &mut err);
    check_posts(collections["posts"], &mut err);

    if !err.is_empty() {
        return Err(err);
    }

    // every field is checked above; this only catches shapes the checks do not know
    serde_json::from_value::<ExtractedEntityPayload>(raw.clone())
        .map_err(|e| ValidationError::single(ViolationKind::Structural, format!("payload does not match the entity model: {e}")))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn non_empty_str<'a>(item: &'a Value, field: &str) -> Option<&'a str> {
    item.get(field).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

/// Reports `at.field` when it is present but not a string. Returns false in that case.
fn check_text_type(item: &Value, at: &str, field: &str, err: &mut ValidationError) -> bool {
    match item.get(field) {
        None | Some(Value::Null) | Some(Value::String(_)) => true,
        Some(other) => {
            err.push(ViolationKind::Structural, format!("{at}.{field} must be a string, got {}", type_name(other)));
            false
        }
    }
}

/// A required text field: wrong type and missing are reported once each, never both.
fn required_text<'a>(item: &'a Value, at: &str, field: &str, err: &mut ValidationError) -> Option<&'a str> {
    if !check_text_type(item, at, field, err) {
        return None;
    }
    let value = non_empty_str(item, field);
    if value.is_none() {
        err.push(ViolationKind::RequiredField, format!("{at}.{field} is missing or empty"));
    }
    value
}

/// Required fields. Returns the trimmed names per entity collection.
fn check_entities<'a>(
    collections: &HashMap<&str, &'a Vec<Value>>,
    err: &mut ValidationError,
) -> HashMap<&'static str, HashSet<&'a str>> {
    let mut names = HashMap::new();
    for collection in ENTITY_COLLECTIONS {
        let mut seen = HashSet::new();
        for (i, item) in collections[collection].iter().enumerate() {
            if !item.is_object() {
                err.push(
                    ViolationKind::Structural,
                    format!("{collection}[{i}] must be an object, got {}", type_name(item)),
                );
                continue;
            }
            let at = format!("{collection}[{i}]");
            if let Some(name) = required_text(item, &at, "name", err) {
                seen.insert(name);
            }
            for field in optional_text_fields(collection) {
                check_text_type(item, &at, field, err);
            }
            if collection == "patterns" {
                match item.get("kind") {
                    Some(Value::String(kind)) if PatternKind::parse(kind).is_some() => {}
                    Some(Value::String(kind)) => err.push(
                        ViolationKind::RequiredField,
                        format!("patterns[{i}].kind `{kind}` is not one of pattern, anti-pattern"),
                    ),
                    None | Some(Value::Null) => {
                        err.push(ViolationKind::RequiredField, format!("patterns[{i}].kind is missing"))
                    }
                    Some(other) => err.push(
                        ViolationKind::Structural,
                        format!("patterns[{i}].kind must be a string, got {}", type_name(other)),
                    ),
                }
            }
        }
        names.insert(collection, seen);
    }
    names
}

fn check_links(
    collections: &HashMap<&str, &Vec<Value>>,
    names: &HashMap<&'static str, HashSet<&str>>,
    err: &mut ValidationError,
) {
    for link in LINK_COLLECTIONS {
        let Some((target, field)) = link_target(link) else { continue };
        for (i, item) in collections[link].iter().enumerate() {
            if !item.is_object() {
                err.push(ViolationKind::Structural, format!("{link}[{i}] must be an object, got {}", type_name(item)));
                continue;
            }
            let at = format!("{link}[{i}]");
            for (field, target) in [("pattern_name", "patterns"), (field, target)] {
                match required_text(item, &at, field, err) {
                    Some(name) if !names[target].contains(name) => err.push(
                        ViolationKind::OrphanReference,
                        format!("{at} {field} \"{name}\" not found in {target}"),
                    ),
                    _ => {}
                }
            }
        }
    }
}

fn check_denylist(value: &Value, path: &str, denylist: &Denylist, err: &mut ValidationError) {
    match value {
        Value::String(text) => {
            if let Some(pattern) = denylist.find(text) {
                err.push(ViolationKind::Safety, format!("{path} matches denylist pattern `{pattern}`"));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_denylist(item, &format!("{path}[{i}]"), denylist, err);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                check_denylist(item, &child, denylist, err);
            }
        }
        _ => {}
    }
}

fn parse_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
}

/// Dates must parse; posts sharing a URL must agree on their source.
fn check_posts(posts: &[Value], err: &mut ValidationError) {
    let mut sources: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (i, post) in posts.iter().enumerate() {
        // a non-string value is already a type violation
        if let Some(published) = non_empty_str(post, "published") {
            if !parse_date(published) {
                err.push(ViolationKind::Semantic, format!("posts[{i}].published \"{published}\" is not a valid date"));
            }
        }
        if let (Some(url), Some(source)) = (non_empty_str(post, "url"), non_empty_str(post, "source")) {
            sources.entry(url).or_default().insert(source);
        }
    }
    for (url, found) in sources {
        if found.len() > 1 {
            let list = found.iter().map(|s| format!("\"{s}\"")).collect::<Vec<_>>().join(", ");
            err.push(ViolationKind::Semantic, format!("posts sharing url \"{url}\" disagree on source: {list}"));
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyUpsert {
    denylist: Arc<Denylist>,
}

impl VerifyUpsert {
    pub const NAME: &'static str = "verify_upsert";

    pub fn new(denylist: Arc<Denylist>) -> Self {
        Self { denylist }
    }
}

#[async_trait]
impl Step for VerifyUpsert {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process(&self, body: &MessageBody, _flow_kind: FlowKind) -> Result<StepOutcome, StepError> {
        let Some(raw) = body.get(keys::PAYLOAD) else {
            return Ok(super::rejected(&ValidationError::single(ViolationKind::Structural, "no payload to verify")));
        };

        Ok(match verify_upsert(raw, &self.denylist) {
            Ok(payload) => StepOutcome::yes(format!(
                "payload verified: {} entities, {} links",
                payload.entity_count(),
                payload.link_count()
            ))
            .with_mutation(Mutation::set(keys::PAYLOAD_VERIFIED, true)),
            Err(err) => super::rejected(&err).with_mutation(Mutation::remove(keys::PAYLOAD_VERIFIED)),
        })
    }
}
