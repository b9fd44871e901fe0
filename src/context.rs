//! Grounding text for the LLM.
//!
//! The specification (instructions plus table schema) is loaded once and
//! shared read-only. Rendering is pure: the same specification and input
//! always give byte-identical prompts, which is what the SQL cache keys on.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{Arc, OnceLock},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Specification {
    /// Instruction block placed at the top of every system prompt.
    pub instructions: String,
    /// Table name -> ordered column list.
    #[serde(default)]
    pub schema: BTreeMap<String, Vec<String>>,
    /// Case-insensitive regexes for the injection denylist. `None` keeps the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denylist: Option<Vec<String>>,
}

impl Specification {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Specification(format!("{}: {e}", path.display())))?;
        let specification: Specification = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| ConfigurationError::Specification(format!("{}: {e}", path.display())))?,
            _ => serde_yaml_bw::from_str(&raw)
                .map_err(|e| ConfigurationError::Specification(format!("{}: {e}", path.display())))?,
        };
        specification.check()?;
        info!(path = %path.display(), tables = specification.schema.len(), "specification loaded");
        Ok(specification)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigurationError> {
        let specification: Specification =
            serde_yaml_bw::from_str(raw).map_err(|e| ConfigurationError::Specification(e.to_string()))?;
        specification.check()?;
        Ok(specification)
    }

    /// The specification shipped in `config/specification.yaml`.
    pub fn bundled() -> Result<Self, ConfigurationError> {
        Self::from_yaml(BUNDLED_SPECIFICATION)
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        if self.instructions.trim().is_empty() {
            return Err(ConfigurationError::Specification("instructions are empty".into()));
        }
        for (table, columns) in &self.schema {
            if table.trim().is_empty() {
                return Err(ConfigurationError::Specification("table with an empty name".into()));
            }
            if columns.is_empty() {
                return Err(ConfigurationError::Specification(format!("table `{table}` has no columns")));
            }
        }
        Ok(())
    }

    /// One line per table, tables sorted by name, columns in declared order.
    pub fn render_schema(&self) -> String {
        self.schema
            .iter()
            .map(|(table, columns)| format!("{table} ({})", columns.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

const BUNDLED_SPECIFICATION: &str = include_str!("../config/specification.yaml");

static SPECIFICATION: OnceLock<Arc<Specification>> = OnceLock::new();

/// Install the process-wide specification. The first call wins.
pub fn install_specification(specification: Specification) -> Arc<Specification> {
    let installed = SPECIFICATION.get_or_init(|| Arc::new(specification.clone()));
    if **installed != specification {
        warn!("specification already installed, ignoring the new one");
    }
    Arc::clone(installed)
}

pub fn installed_specification() -> Option<Arc<Specification>> {
    SPECIFICATION.get().cloned()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PromptContext {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    specification: Arc<Specification>,
}

impl ContextBuilder {
    pub fn new(specification: Arc<Specification>) -> Self {
        Self { specification }
    }

    /// Builder over the installed specification.
    pub fn global() -> Result<Self, ConfigurationError> {
        installed_specification()
            .map(Self::new)
            .ok_or_else(|| ConfigurationError::Specification("no specification installed".into()))
    }

    pub fn specification(&self) -> &Specification {
        &self.specification
    }

    pub fn build_context(&self, input: &str) -> PromptContext {
        let mut system = self.specification.instructions.trim_end().to_string();
        let schema = self.specification.render_schema();
        if !schema.is_empty() {
            system.push_str("\n\nSchema:\n");
            system.push_str(&schema);
        }
        system.push('\n');

        PromptContext { system, user: input.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_specification() -> Specification {
        let mut schema = BTreeMap::new();
        schema.insert(
            "patterns".to_string(),
            vec!["id".into(), "name".into(), "description".into(), "kind".into()],
        );
        schema.insert("posts".to_string(), vec!["id".into(), "name".into(), "url".into()]);
        Specification {
            instructions: "Translate the rule into one SQLite SELECT statement.".into(),
            schema,
            denylist: None,
        }
    }

    #[test]
    fn test_system_contains_instructions_and_schema() {
        let builder = ContextBuilder::new(Arc::new(sample_specification()));
        let ctx = builder.build_context("Find all patterns");

        assert!(ctx.system.starts_with("Translate the rule into one SQLite SELECT statement."));
        assert!(ctx.system.contains("patterns (id, name, description, kind)"));
        assert_eq!(ctx.user, "Find all patterns");
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let a = ContextBuilder::new(Arc::new(sample_specification())).build_context("x");
        let b = ContextBuilder::new(Arc::new(sample_specification())).build_context("x");
        assert_eq!(a, b);
        // tables come out sorted regardless of insertion order
        let patterns = a.system.find("patterns (").unwrap();
        let posts = a.system.find("posts (").unwrap();
        assert!(patterns < posts);
    }

    #[test]
    fn test_load_yaml_and_reject_empty_instructions() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "instructions: \"Be precise.\"\nschema:\n  rules: [id, rule_code]").unwrap();
        let loaded = Specification::load(file.path()).unwrap();
        assert_eq!(loaded.schema["rules"], vec!["id".to_string(), "rule_code".to_string()]);

        let mut bad = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(bad, "instructions: \"  \"").unwrap();
        assert!(matches!(
            Specification::load(bad.path()),
            Err(ConfigurationError::Specification(_))
        ));
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"instructions":"Go.","schema":{{"t":["a","b"]}},"denylist":["drop"]}}"#).unwrap();
        let loaded = Specification::load(file.path()).unwrap();
        assert_eq!(loaded.render_schema(), "t (a, b)");
        assert_eq!(loaded.denylist, Some(vec!["drop".to_string()]));
    }

    #[test]
    fn test_bundled_specification_covers_store_tables() {
        let specification = Specification::bundled().unwrap();
        for table in crate::store::schema::BASE_TABLES {
            assert!(specification.schema.contains_key(table), "{table} missing from bundled schema");
        }
        assert!(specification.denylist.is_none());
    }
}
