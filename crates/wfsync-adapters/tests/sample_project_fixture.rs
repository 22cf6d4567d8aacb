use std::path::PathBuf;

use wfsync_adapters::{CollectionReader, MemoryPortal, ProjectStore, UserDirectory};

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-project/portal.json")
}

#[tokio::test]
async fn sample_project_fixture_loads_into_memory_portal() {
    let portal = MemoryPortal::from_fixture(fixture_path()).expect("fixture");

    let project = portal.item_data("src-project").await.expect("source project");
    let workers_url = project["workers"]["url"].as_str().expect("workers url");
    let workers = portal.query_all(workers_url).await.expect("workers");
    assert_eq!(workers.len(), 3);
    assert!(workers[0].geometry.is_some());

    assert!(portal.user_exists("alice").await.expect("lookup"));
    assert!(!portal.user_exists("carol").await.expect("lookup"));
}
