use std::{fs, path::PathBuf, sync::Arc};

use ruleflow::context::{ContextBuilder, Specification};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn builder() -> ContextBuilder {
    ContextBuilder::new(Arc::new(Specification::load(&fixture("specification.yaml")).unwrap()))
}

#[test]
fn system_prompt_matches_golden_file() {
    let golden = fs::read_to_string(fixture("context_system.golden")).unwrap();
    let ctx = builder().build_context("Find all patterns");

    assert_eq!(ctx.system, golden);
    assert_eq!(ctx.user, "Find all patterns");
}

#[test]
fn schema_line_for_patterns_is_rendered_literally() {
    let ctx = builder().build_context("Find all patterns");
    assert!(ctx.system.contains("patterns (id, name, description, kind)"));
    assert!(ctx.system.starts_with("Translate the rule into one SQLite SELECT statement."));
}

#[test]
fn builders_over_the_same_file_agree_byte_for_byte() {
    let a = builder().build_context("List anti-patterns mentioned with a guest");
    let b = builder().build_context("List anti-patterns mentioned with a guest");
    assert_eq!(a, b);
}
