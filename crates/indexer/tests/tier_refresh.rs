use lore_indexer::{
    fingerprint_files, FileLister, ItemState, ProjectFileLister, ProjectFingerprint, RefreshMode,
    StaleReason, TierCache,
};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

async fn snapshot(root: &Path) -> ProjectFingerprint {
    let files = ProjectFileLister.list(root).await.expect("list files");
    fingerprint_files(root, &files).await.expect("fingerprint")
}

fn all_succeeded(project: &ProjectFingerprint) -> BTreeMap<String, ItemState> {
    project
        .files
        .iter()
        .map(|f| {
            (
                f.path.clone(),
                ItemState::succeeded(f.item_hash(), Some(format!("summary of {}", f.path))),
            )
        })
        .collect()
}

async fn write_project(root: &Path) {
    tokio::fs::create_dir_all(root.join("src"))
        .await
        .expect("create src");
    tokio::fs::write(root.join("src/main.rs"), "fn main() {}\n")
        .await
        .expect("write main");
    tokio::fs::write(root.join("src/lib.rs"), "pub fn lib() {}\n")
        .await
        .expect("write lib");
    tokio::fs::write(root.join("README.md"), "# demo\n")
        .await
        .expect("write readme");
}

#[tokio::test]
async fn unchanged_project_stays_fresh_across_checks() {
    let temp = TempDir::new().expect("tempdir");
    write_project(temp.path()).await;

    let project = snapshot(temp.path()).await;
    let cache = TierCache::new(temp.path(), "detailed");
    let record = cache.build_record(&project, "model-a", None, all_succeeded(&project));
    cache.save(&record).await.expect("save");

    let again = snapshot(temp.path()).await;
    assert_eq!(again.file_count(), project.file_count());
    let first = cache.check(&again, "model-a", None, false).await.expect("check");
    let second = cache.check(&again, "model-a", None, false).await.expect("check");
    assert!(first.is_fresh());
    assert_eq!(first.assessment, second.assessment);
}

#[tokio::test]
async fn size_change_reprocesses_only_that_file() {
    let temp = TempDir::new().expect("tempdir");
    write_project(temp.path()).await;

    let project = snapshot(temp.path()).await;
    let cache = TierCache::new(temp.path(), "detailed");
    let mut items = all_succeeded(&project);
    let readme_hash = project.get("README.md").expect("readme").item_hash();
    items.insert(
        "README.md".to_string(),
        ItemState::failed(readme_hash, "worker timeout"),
    );
    cache
        .save(&cache.build_record(&project, "model-a", None, items))
        .await
        .expect("save");

    tokio::fs::write(temp.path().join("src/lib.rs"), "pub fn lib() { /* grown */ }\n")
        .await
        .expect("grow lib");

    let changed = snapshot(temp.path()).await;
    let check = cache
        .check(&changed, "model-a", None, false)
        .await
        .expect("check");
    assert!(check
        .assessment
        .reasons
        .contains(&StaleReason::ContentChanged));

    let plan = check.plan(&changed, RefreshMode::Incremental);
    let mut processed: Vec<&str> = plan.to_process.iter().map(|f| f.path.as_str()).collect();
    processed.sort_unstable();
    assert_eq!(processed, vec!["README.md", "src/lib.rs"]);
    assert_eq!(plan.carried.len(), 1);
    assert_eq!(
        plan.carried["src/main.rs"].summary.as_deref(),
        Some("summary of src/main.rs")
    );
}

#[tokio::test]
async fn model_switch_marks_tier_stale() {
    let temp = TempDir::new().expect("tempdir");
    write_project(temp.path()).await;

    let project = snapshot(temp.path()).await;
    let cache = TierCache::new(temp.path(), "quick");
    cache
        .save(&cache.build_record(&project, "model-a", None, all_succeeded(&project)))
        .await
        .expect("save");

    let check = cache
        .check(&project, "model-b", None, false)
        .await
        .expect("check");
    assert_eq!(check.assessment.reasons, vec![StaleReason::ModelChanged]);
}
