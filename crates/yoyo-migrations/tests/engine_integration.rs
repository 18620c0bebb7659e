//! End-to-end tests for the migration engine against SQLite.
//!
//! These tests exercise the full pipeline — source discovery, graph
//! resolution, plan building, and the two-level transaction executor —
//! verifying:
//! - linear and diamond dependency ordering with the lexicographic tie-break
//! - applied-set atomicity under mid-migration failure
//! - ignore-errors policies
//! - the post-apply hook firing rules
//! - tolerance of applied identities with no available definition
//! - idempotent re-apply and schema round-trips
//! - cross-process lock contention

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use yoyo_backends::{MigrationBackend, SqliteBackend};
use yoyo_core::{Error, MigrationConfig};
use yoyo_migrations::{
    apply_migrations, apply_migrations_only, mark_migrations, read_migrations,
    reapply_migrations, rollback_migrations, rollback_one, unmark_migrations,
};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn create_temp_dir(label: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "yoyo_test_{label}_{}_{id}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn cleanup(dir: &Path) {
    let _ = fs::remove_dir_all(dir);
}

fn write_linear_chain(dir: &Path) {
    fs::write(
        dir.join("001_users.sql"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY);",
    )
    .unwrap();
    fs::write(dir.join("001_users.rollback.sql"), "DROP TABLE users;").unwrap();
    fs::write(
        dir.join("002_posts.sql"),
        "-- depends: 001_users\nCREATE TABLE posts (id INTEGER PRIMARY KEY);",
    )
    .unwrap();
    fs::write(dir.join("002_posts.rollback.sql"), "DROP TABLE posts;").unwrap();
    fs::write(
        dir.join("003_tags.sql"),
        "-- depends: 002_posts\nCREATE TABLE tags (id INTEGER PRIMARY KEY);",
    )
    .unwrap();
    fs::write(dir.join("003_tags.rollback.sql"), "DROP TABLE tags;").unwrap();
}

async fn applied_ids(backend: &dyn MigrationBackend) -> Vec<String> {
    backend
        .list_applied()
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.id)
        .collect()
}

async fn schema_fingerprint(backend: &dyn MigrationBackend) -> Vec<String> {
    backend
        .query_strings(
            "SELECT sql FROM sqlite_master WHERE type='table' \
             AND name NOT LIKE '\\_yoyo%' ESCAPE '\\' ORDER BY name",
        )
        .await
        .unwrap()
}

// ── 1. Linear chain ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_linear_apply_then_targeted_rollback() {
    let dir = create_temp_dir("linear");
    write_linear_chain(&dir);

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    let set = read_migrations(&[dir.clone()]).unwrap();

    let report = apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert_eq!(report.applied, vec!["001_users", "002_posts", "003_tags"]);
    assert_eq!(
        applied_ids(&backend).await,
        vec!["001_users", "002_posts", "003_tags"]
    );

    // Rolling back to revision 002 removes 002 and its dependents.
    rollback_migrations(&backend, &set, Some("002_posts"), false, &config)
        .await
        .unwrap();
    assert_eq!(applied_ids(&backend).await, vec!["001_users"]);
    let tables = backend
        .query_strings("SELECT name FROM sqlite_master WHERE name IN ('posts','tags')")
        .await
        .unwrap();
    assert!(tables.is_empty());

    cleanup(&dir);
}

// ── 2. Diamond with lexicographic tie-break ─────────────────────────────

#[tokio::test]
async fn test_diamond_apply_order() {
    let dir = create_temp_dir("diamond");
    fs::write(dir.join("A.sql"), "CREATE TABLE ta (x INTEGER);").unwrap();
    fs::write(
        dir.join("B.sql"),
        "-- depends: A\nCREATE TABLE tb (x INTEGER);",
    )
    .unwrap();
    fs::write(
        dir.join("C.sql"),
        "-- depends: A\nCREATE TABLE tc (x INTEGER);",
    )
    .unwrap();
    fs::write(
        dir.join("D.sql"),
        "-- depends: B C\nCREATE TABLE td (x INTEGER);",
    )
    .unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    let set = read_migrations(&[dir.clone()]).unwrap();

    let report = apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert_eq!(report.applied, vec!["A", "B", "C", "D"]);

    cleanup(&dir);
}

// ── 3. ignore-errors on apply ───────────────────────────────────────────

#[tokio::test]
async fn test_ignore_errors_apply_with_preexisting_table() {
    let dir = create_temp_dir("ignore");
    fs::write(
        dir.join("001_foo.sql"),
        "-- ignore-errors: apply\nCREATE TABLE foo (id INTEGER);",
    )
    .unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    // The table already exists, so the step's CREATE fails.
    backend
        .execute("CREATE TABLE foo (id INTEGER)", &[])
        .await
        .unwrap();

    let set = read_migrations(&[dir.clone()]).unwrap();
    let report = apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();

    assert_eq!(report.applied, vec!["001_foo"]);
    assert_eq!(applied_ids(&backend).await, vec!["001_foo"]);

    cleanup(&dir);
}

// ── 4. Mid-migration failure leaves no partial state ────────────────────

#[tokio::test]
async fn test_mid_migration_failure_is_atomic() {
    let dir = create_temp_dir("midfail");
    fs::write(dir.join("001_ok.sql"), "CREATE TABLE ok (x INTEGER);").unwrap();
    fs::write(
        dir.join("002_boom.sql"),
        "-- depends: 001_ok\n\
         CREATE TABLE half_done (x INTEGER);\n\
         INSERT INTO does_not_exist VALUES (1);",
    )
    .unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    let set = read_migrations(&[dir.clone()]).unwrap();

    let err = apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Step { .. }));
    let message = err.to_string();
    assert!(message.contains("002_boom"));
    assert!(message.contains("applying"));

    // 001 committed, 002 fully rolled back.
    assert_eq!(applied_ids(&backend).await, vec!["001_ok"]);
    let tables = backend
        .query_strings("SELECT name FROM sqlite_master WHERE name='half_done'")
        .await
        .unwrap();
    assert!(tables.is_empty());

    cleanup(&dir);
}

// ── 5. Post-apply hook ──────────────────────────────────────────────────

#[tokio::test]
async fn test_post_apply_runs_after_forward_plan_only() {
    let dir = create_temp_dir("postapply");
    fs::write(dir.join("001_t.sql"), "CREATE TABLE t (x INTEGER);").unwrap();
    fs::write(
        dir.join("post-apply.sql"),
        "INSERT INTO hook_log (note) VALUES ('ran');",
    )
    .unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    backend
        .execute("CREATE TABLE hook_log (note TEXT)", &[])
        .await
        .unwrap();

    let set = read_migrations(&[dir.clone()]).unwrap();

    // First apply: one migration applied, hook runs once.
    let report = apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert!(report.post_apply_ran);
    let hook_runs = backend
        .query_strings("SELECT note FROM hook_log")
        .await
        .unwrap();
    assert_eq!(hook_runs.len(), 1);

    // Second apply: nothing to do, hook must not run again.
    let report = apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert!(report.applied.is_empty());
    assert!(!report.post_apply_ran);
    let hook_runs = backend
        .query_strings("SELECT note FROM hook_log")
        .await
        .unwrap();
    assert_eq!(hook_runs.len(), 1);

    // The hook is never recorded in the applied-set.
    assert_eq!(applied_ids(&backend).await, vec!["001_t"]);

    cleanup(&dir);
}

#[tokio::test]
async fn test_apply_only_skips_post_apply() {
    let dir = create_temp_dir("applyonly");
    fs::write(dir.join("001_t.sql"), "CREATE TABLE t (x INTEGER);").unwrap();
    fs::write(
        dir.join("post-apply.sql"),
        "INSERT INTO hook_log (note) VALUES ('ran');",
    )
    .unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    backend
        .execute("CREATE TABLE hook_log (note TEXT)", &[])
        .await
        .unwrap();

    let set = read_migrations(&[dir.clone()]).unwrap();
    let report = apply_migrations_only(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert_eq!(report.applied, vec!["001_t"]);
    assert!(!report.post_apply_ran);
    assert!(backend
        .query_strings("SELECT note FROM hook_log")
        .await
        .unwrap()
        .is_empty());

    cleanup(&dir);
}

#[tokio::test]
async fn test_post_apply_runs_after_reapply() {
    let dir = create_temp_dir("reapplyhook");
    fs::write(
        dir.join("001_t.sql"),
        "CREATE TABLE t (x INTEGER);",
    )
    .unwrap();
    fs::write(dir.join("001_t.rollback.sql"), "DROP TABLE t;").unwrap();
    fs::write(
        dir.join("post-apply.sql"),
        "INSERT INTO hook_log (note) VALUES ('ran');",
    )
    .unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    backend
        .execute("CREATE TABLE hook_log (note TEXT)", &[])
        .await
        .unwrap();

    let set = read_migrations(&[dir.clone()]).unwrap();
    apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();

    // Reapply ends in a forward phase, so the hook fires again.
    let report = reapply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert_eq!(report.rolled_back, vec!["001_t"]);
    assert_eq!(report.applied, vec!["001_t"]);
    assert!(report.post_apply_ran);
    let hook_runs = backend
        .query_strings("SELECT note FROM hook_log")
        .await
        .unwrap();
    assert_eq!(hook_runs.len(), 2);

    cleanup(&dir);
}

// ── 6. Applied identity with no available definition ────────────────────

#[tokio::test]
async fn test_unknown_applied_migration_is_tolerated_forward_fatal_backward() {
    let dir = create_temp_dir("unknown");
    fs::write(dir.join("001_t.sql"), "CREATE TABLE t (x INTEGER);").unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    backend.ensure_internal_tables().await.unwrap();
    backend
        .record_applied("099_vanished", chrono::Utc::now())
        .await
        .unwrap();

    let set = read_migrations(&[dir.clone()]).unwrap();

    // Apply leaves the unknown row alone.
    apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    let ids = applied_ids(&backend).await;
    assert!(ids.contains(&"099_vanished".to_string()));
    assert!(ids.contains(&"001_t".to_string()));

    // Rolling back to the unknown revision is a clear failure.
    let err = rollback_migrations(&backend, &set, Some("099_vanished"), false, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Resolution(_)));
    assert!(err.to_string().contains("099_vanished"));

    // A full rollback refuses too, unless forced.
    let err = rollback_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Resolution(_)));
    rollback_migrations(&backend, &set, None, true, &config)
        .await
        .unwrap();
    assert_eq!(applied_ids(&backend).await, vec!["099_vanished"]);

    cleanup(&dir);
}

// ── Idempotence ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_apply_twice_runs_zero_steps_the_second_time() {
    let dir = create_temp_dir("idempotent");
    fs::write(
        dir.join("001_count.sql"),
        "CREATE TABLE counter (x INTEGER);\nINSERT INTO counter VALUES (1);",
    )
    .unwrap();

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    let set = read_migrations(&[dir.clone()]).unwrap();

    apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    let before = applied_ids(&backend).await;

    let report = apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(applied_ids(&backend).await, before);
    // The INSERT ran exactly once.
    let rows = backend
        .query_strings("SELECT x FROM counter")
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    cleanup(&dir);
}

// ── Round-trip schema fingerprint ───────────────────────────────────────

#[tokio::test]
async fn test_apply_rollback_round_trip_restores_schema() {
    let dir = create_temp_dir("roundtrip");
    write_linear_chain(&dir);

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    backend.ensure_internal_tables().await.unwrap();
    let set = read_migrations(&[dir.clone()]).unwrap();

    let before = schema_fingerprint(&backend).await;
    apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert_ne!(schema_fingerprint(&backend).await, before);

    rollback_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    assert_eq!(schema_fingerprint(&backend).await, before);
    assert!(applied_ids(&backend).await.is_empty());

    cleanup(&dir);
}

// ── rollback_one ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rollback_one_removes_only_newest() {
    let dir = create_temp_dir("rollbackone");
    write_linear_chain(&dir);

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    let set = read_migrations(&[dir.clone()]).unwrap();

    apply_migrations(&backend, &set, None, false, &config)
        .await
        .unwrap();
    let report = rollback_one(&backend, &set, false, &config).await.unwrap();
    assert_eq!(report.rolled_back, vec!["003_tags"]);
    assert_eq!(
        applied_ids(&backend).await,
        vec!["001_users", "002_posts"]
    );

    cleanup(&dir);
}

// ── mark / unmark ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_mark_and_unmark_only_touch_the_applied_set() {
    let dir = create_temp_dir("marks");
    write_linear_chain(&dir);

    let config = MigrationConfig::default();
    let backend = SqliteBackend::memory(&config).unwrap();
    let set = read_migrations(&[dir.clone()]).unwrap();

    mark_migrations(&backend, &set, Some("002_posts"), &config)
        .await
        .unwrap();
    assert_eq!(
        applied_ids(&backend).await,
        vec!["001_users", "002_posts"]
    );
    // No tables were actually created.
    let tables = backend
        .query_strings("SELECT name FROM sqlite_master WHERE name IN ('users','posts')")
        .await
        .unwrap();
    assert!(tables.is_empty());

    unmark_migrations(&backend, &set, Some("001_users"), &config)
        .await
        .unwrap();
    // Unmarking 001 also unmarks its dependent 002.
    assert!(applied_ids(&backend).await.is_empty());

    cleanup(&dir);
}

// ── Lock contention ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_lock_contention_times_out() {
    let dir = create_temp_dir("lockdb");
    let db_path = dir.join("shared.db");
    fs::write(dir.join("001_t.sql"), "CREATE TABLE t (x INTEGER);").unwrap();

    let config =
        MigrationConfig::default().lock_timeout(Some(std::time::Duration::from_millis(200)));
    let holder = SqliteBackend::open(&db_path, &config).unwrap();
    let contender = SqliteBackend::open(&db_path, &config).unwrap();
    holder.ensure_internal_tables().await.unwrap();
    holder.lock(None).await.unwrap();

    let set = read_migrations(&[dir.clone()]).unwrap();
    let err = apply_migrations(&contender, &set, None, false, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));

    // Once the holder releases, the same operation goes through.
    holder.unlock().await.unwrap();
    apply_migrations(&contender, &set, None, false, &config)
        .await
        .unwrap();
    assert_eq!(applied_ids(&contender).await, vec!["001_t"]);

    cleanup(&dir);
}
