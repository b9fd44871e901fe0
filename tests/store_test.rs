use futures::future::join_all;
use ruleflow::{
    error::IntegrityError,
    store::{ContentStore, RegistryStore, SqliteStore, StoreError, ViewStore},
};
use serde_json::json;

#[tokio::test]
async fn upsert_view_replaces_rule_reference_in_place() {
    let store = SqliteStore::open_in_memory().unwrap();
    let r1 = store.upsert_rule("R1", "one", "", "SELECT 1").await.unwrap();
    let r2 = store.upsert_rule("R2", "two", "", "SELECT 2").await.unwrap();

    let first = store.upsert_view("t1", r1, "s1").await.unwrap();
    let before = store.view_by_table("t1").await.unwrap().unwrap();
    let second = store.upsert_view("t1", r2, "s2").await.unwrap();

    assert_eq!(first, second);
    let views = store.list_views().await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].rule_id, r2);
    assert_eq!(views[0].summary, "s2");
    assert_eq!(views[0].created_at, before.created_at);
}

#[tokio::test]
async fn view_cannot_reference_a_missing_rule() {
    let store = SqliteStore::open_in_memory().unwrap();
    let err = store.upsert_view("t1", 999, "dangling").await.unwrap_err();
    assert!(matches!(err, StoreError::Integrity(IntegrityError::ForeignKeyViolation(_))));
    assert!(store.list_views().await.unwrap().is_empty());
}

#[tokio::test]
async fn rules_survive_a_file_backed_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.upsert_rule("R1", "one", "", "SELECT 1").await.unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    let id = store.upsert_rule("R1", "one again", "", "SELECT 2").await.unwrap();
    let rules = store.list_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, id);
    assert_eq!(rules[0].sql, "SELECT 2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rule_upserts_have_one_winner() {
    let store = SqliteStore::open_in_memory().unwrap();
    let sqls: Vec<String> = (0..16).map(|i| format!("SELECT {i}")).collect();

    let ids = join_all(sqls.iter().map(|sql| store.upsert_rule("HOT", "hot", "", sql))).await;

    let ids: Vec<i64> = ids.into_iter().map(Result::unwrap).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    let rules = store.list_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert!(sqls.contains(&rules[0].sql));
}

#[tokio::test]
async fn materialized_view_counts_rows_from_content() {
    let store = SqliteStore::open_in_memory().unwrap();
    let doc = json!({
        "posts": [{"name": "A"}, {"name": "B"}],
        "patterns": [{"name": "P", "kind": "pattern"}, {"name": "Q", "kind": "anti-pattern"}],
        "pattern_post_link": [{"pattern_name": "P", "post_name": "A"}, {"pattern_name": "Q", "post_name": "B"}]
    });
    let summary = store.upsert_content(&doc.to_string()).await.unwrap();
    assert_eq!(summary.links_added, 2);

    let rows = store
        .materialize_view("rule_good", "SELECT name FROM patterns WHERE kind = 'pattern'")
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let again = store.upsert_content(&doc.to_string()).await.unwrap();
    assert_eq!(again.links_added, 0);
    assert_eq!(store.content_counts().await.unwrap().links, 2);
}
