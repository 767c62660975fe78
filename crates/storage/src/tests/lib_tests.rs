use super::*;

#[tokio::test]
async fn sqlite_store_round_trips_and_overwrites() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    assert_eq!(store.get("closed").await.expect("get"), None);

    store.set("closed", "[\"1\"]").await.expect("set");
    store.set("closed", "[\"1\",\"2\"]").await.expect("overwrite");
    assert_eq!(
        store.get("closed").await.expect("get").as_deref(),
        Some("[\"1\",\"2\"]")
    );

    store.remove("closed").await.expect("remove");
    assert_eq!(store.get("closed").await.expect("get"), None);
}

#[tokio::test]
async fn values_survive_reopening_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("client.db");
    let url = prepare_store_url(db_path.to_string_lossy().as_ref()).expect("url");

    {
        let store = SqliteStore::new(&url).await.expect("db");
        store.set("token", "abc").await.expect("set");
        drop(store);
    }

    assert!(db_path.exists(), "database file should exist: {}", db_path.display());
    let reopened = SqliteStore::new(&url).await.expect("reopen");
    assert_eq!(reopened.get("token").await.expect("get").as_deref(), Some("abc"));
}

#[tokio::test]
async fn clear_drops_every_key() {
    let store = MemoryStore::new();
    store.set("a", "1").await.expect("set");
    store.set("b", "2").await.expect("set");
    store.clear().await.expect("clear");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn json_helpers_report_corrupt_values() {
    let store = MemoryStore::new();
    save_json(&store, "ids", &vec![1, 2, 3]).await.expect("save");
    let ids: Option<Vec<i64>> = load_json(&store, "ids").await.expect("load");
    assert_eq!(ids, Some(vec![1, 2, 3]));

    store.set("ids", "not json").await.expect("set");
    let err = load_json::<Vec<i64>>(&store, "ids").await.expect_err("corrupt");
    assert!(err.to_string().contains("ids"));
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(normalize_store_url("./data/test.db"), "sqlite://./data/test.db");
    assert_eq!(normalize_store_url(""), "sqlite::memory:");
    assert_eq!(
        normalize_store_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite://C:/Users/alice/test.db"
    );
}
