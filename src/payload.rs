// src/payload.rs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Top-level collections of an extraction, in the order they are checked and stored.
pub const ENTITY_COLLECTIONS: [&str; 4] = ["posts", "organizations", "guests", "patterns"];
pub const LINK_COLLECTIONS: [&str; 3] = ["pattern_post_link", "pattern_org_link", "pattern_guest_link"];

/// Entities pulled out of one web page. Links refer to entities by name
/// within the same payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEntityPayload {
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub guests: Vec<Guest>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub pattern_post_link: Vec<PatternPostLink>,
    #[serde(default)]
    pub pattern_org_link: Vec<PatternOrgLink>,
    #[serde(default)]
    pub pattern_guest_link: Vec<PatternGuestLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Post {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Publisher or site the post came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// ISO date (`YYYY-MM-DD`) or RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Organization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Guest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PatternKind {
    #[serde(rename = "pattern")]
    Pattern,
    #[serde(rename = "anti-pattern")]
    AntiPattern,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Pattern => "pattern",
            PatternKind::AntiPattern => "anti-pattern",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pattern" => Some(PatternKind::Pattern),
            "anti-pattern" => Some(PatternKind::AntiPattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Pattern {
    pub name: String,
    pub kind: PatternKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PatternPostLink {
    pub pattern_name: String,
    pub post_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PatternOrgLink {
    pub pattern_name: String,
    pub org_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PatternGuestLink {
    pub pattern_name: String,
    pub guest_name: String,
}

/// Link collection -> (target entity collection, field naming the target).
pub fn link_target(link_collection: &str) -> Option<(&'static str, &'static str)> {
    match link_collection {
        "pattern_post_link" => Some(("posts", "post_name")),
        "pattern_org_link" => Some(("organizations", "org_name")),
        "pattern_guest_link" => Some(("guests", "guest_name")),
        _ => None,
    }
}

/// Optional text fields of each entity collection, as declared on the entity types.
pub fn optional_text_fields(entity_collection: &str) -> &'static [&'static str] {
    match entity_collection {
        "posts" => &["url", "source", "published", "summary"],
        "organizations" => &["url", "description"],
        "guests" => &["organization", "description"],
        "patterns" => &["description"],
        _ => &[],
    }
}

impl ExtractedEntityPayload {
    pub fn entity_count(&self) -> usize {
        self.posts.len() + self.organizations.len() + self.guests.len() + self.patterns.len()
    }

    pub fn link_count(&self) -> usize {
        self.pattern_post_link.len() + self.pattern_org_link.len() + self.pattern_guest_link.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_collections_default_to_empty() {
        let payload: ExtractedEntityPayload =
            serde_json::from_value(json!({ "posts": [{ "name": "X" }] })).unwrap();
        assert_eq!(payload.posts.len(), 1);
        assert!(payload.patterns.is_empty());
        assert!(payload.pattern_guest_link.is_empty());
        assert_eq!(payload.entity_count(), 1);
        assert_eq!(payload.link_count(), 0);
    }

    #[test]
    fn test_pattern_kind_wire_names() {
        let p: Pattern = serde_json::from_value(json!({ "name": "P", "kind": "anti-pattern" })).unwrap();
        assert_eq!(p.kind, PatternKind::AntiPattern);
        assert!(serde_json::from_value::<Pattern>(json!({ "name": "P", "kind": "idiom" })).is_err());
        assert_eq!(PatternKind::parse("pattern"), Some(PatternKind::Pattern));
    }

    #[test]
    fn test_optional_text_fields_match_the_types() {
        let post = Post {
            name: "X".into(),
            url: Some("u".into()),
            source: Some("s".into()),
            published: Some("2024-01-01".into()),
            summary: Some("t".into()),
        };
        let value = serde_json::to_value(&post).unwrap();
        for field in optional_text_fields("posts") {
            assert!(value[field].is_string(), "{field}");
        }
        assert_eq!(value.as_object().unwrap().len(), optional_text_fields("posts").len() + 1);
        assert!(optional_text_fields("pattern_post_link").is_empty());
    }
}
