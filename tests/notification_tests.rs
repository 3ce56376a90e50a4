/// Notification tests
///
/// Change listeners, run loop delivery, auto-refresh and external changes
/// Run with: cargo test --test notification_tests

use snapvault::{
    ChangeNotification, ClassSchema, Configuration, DataType, Database, DbError, ExecutionContext,
    NotificationKind, NotificationToken, ObjectData, Property, Schema, Version,
    spawn_change_watcher,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn schema() -> Schema {
    Schema::new(vec![ClassSchema::new(
        "Note",
        vec![Property::new("text", DataType::Text).not_null()],
    )])
}

fn open(path: &Path) -> Database {
    Database::open(Configuration::new(path).schema(schema()).schema_version(1)).unwrap()
}

fn add_note(db: &Database, text: &str) -> Version {
    db.begin_write().unwrap();
    db.insert("Note", ObjectData::new().set("text", text)).unwrap();
    db.commit().unwrap()
}

fn recorder() -> (
    Arc<Mutex<Vec<ChangeNotification>>>,
    impl FnMut(&ChangeNotification) + Send + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |notification: &ChangeNotification| {
        sink.lock().unwrap().push(notification.clone())
    })
}

/// Builds a newer copy of `path` elsewhere and moves it over the original,
/// as another process committing would.
fn commit_from_outside(temp_dir: &TempDir, path: &Path, commits: usize) -> Version {
    let staging: PathBuf = temp_dir.path().join("staging.vault");
    let db = open(&staging);
    let mut version = db.latest_version().unwrap();
    for i in 0..commits {
        version = add_note(&db, &format!("outside {}", i));
    }
    db.close().unwrap();

    let mut stamp = staging.as_os_str().to_owned();
    stamp.push(".version");
    let mut target_stamp = path.as_os_str().to_owned();
    target_stamp.push(".version");
    fs::copy(&staging, path).unwrap();
    fs::copy(stamp, target_stamp).unwrap();
    version
}

#[test]
fn test_listener_runs_when_loop_drains() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir.path().join("drain.vault"));
    let (seen, callback) = recorder();
    db.add_listener(callback).unwrap();

    let version = add_note(&db, "hello");
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(ExecutionContext::current().pending(), 1);

    assert_eq!(ExecutionContext::current().run_pending(), 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, NotificationKind::DidChange);
    assert_eq!(seen[0].version, version);
    assert_eq!(seen[0].committer, Some(db.id()));
}

#[test]
fn test_deliveries_arrive_in_commit_order() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("order.vault");
    let db = open(&path);
    let (seen, callback) = recorder();
    db.add_listener(callback).unwrap();

    let writer_path = path.clone();
    let committed: Vec<Version> = thread::spawn(move || {
        let db = open(&writer_path);
        (0..5).map(|i| add_note(&db, &format!("note {}", i))).collect()
    })
    .join()
    .unwrap();

    db.refresh().unwrap();
    let delivered: Vec<Version> = seen.lock().unwrap().iter().map(|n| n.version).collect();
    assert_eq!(delivered, committed);
}

#[test]
fn test_listener_on_another_context() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir.path().join("other_ctx.vault"));
    let context = ExecutionContext::new();
    let (seen, callback) = recorder();
    db.add_listener_on(&context, callback).unwrap();

    add_note(&db, "hello");
    // The committing thread's own loop has nothing for this listener
    ExecutionContext::current().run_pending();
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(context.pending(), 1);

    let drained = thread::spawn(move || context.run_pending()).join().unwrap();
    assert_eq!(drained, 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_removed_listener_is_not_called() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir.path().join("removed.vault"));
    let (seen, callback) = recorder();
    let token = db.add_listener(callback).unwrap();

    add_note(&db, "scheduled before removal");
    assert!(db.remove_listener(&token));
    assert!(!db.remove_listener(&token));

    ExecutionContext::current().run_pending();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_listener_can_remove_itself() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir.path().join("self_remove.vault"));

    let slot: Arc<Mutex<Option<NotificationToken>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(Mutex::new(0));
    let token = {
        let slot = Arc::clone(&slot);
        let calls = Arc::clone(&calls);
        db.add_listener(move |_| {
            *calls.lock().unwrap() += 1;
            if let Some(token) = slot.lock().unwrap().as_ref() {
                assert!(token.unregister());
            }
        })
        .unwrap()
    };
    *slot.lock().unwrap() = Some(token);

    add_note(&db, "one");
    add_note(&db, "two");
    ExecutionContext::current().run_pending();
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn test_remove_listener_from_another_thread() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir.path().join("remote_remove.vault"));
    let (seen, callback) = recorder();
    let token = db.add_listener(callback).unwrap();

    add_note(&db, "hello");
    let removed = thread::spawn(move || token.unregister()).join().unwrap();
    assert!(removed);

    ExecutionContext::current().run_pending();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_closing_handle_drops_its_listeners() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("close.vault");
    let db = open(&path);
    let (seen, callback) = recorder();
    let token = db.add_listener(callback).unwrap();
    db.close().unwrap();

    assert!(!token.unregister());
    assert!(matches!(
        db.add_listener(|_| {}),
        Err(DbError::TransactionState { .. })
    ));

    let writer = open(&path);
    add_note(&writer, "after close");
    ExecutionContext::current().run_pending();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_auto_refresh_follows_other_writers() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("auto.vault");
    let follower = open(&path);
    let manual = Database::open(
        Configuration::new(&path)
            .schema(schema())
            .schema_version(1)
            .read_only(true)
            .auto_refresh(false),
    )
    .unwrap();
    assert!(follower.auto_refresh().unwrap());
    assert!(!manual.auto_refresh().unwrap());

    let writer_path = path.clone();
    let committed = thread::spawn(move || add_note(&open(&writer_path), "hello"))
        .join()
        .unwrap();

    assert_ne!(follower.version().unwrap(), committed);
    ExecutionContext::current().run_pending();
    assert_eq!(follower.version().unwrap(), committed);
    assert_eq!(follower.count("Note").unwrap(), 1);

    assert_ne!(manual.version().unwrap(), committed);
    assert!(manual.refresh().unwrap());
    assert_eq!(manual.version().unwrap(), committed);
}

#[test]
fn test_external_commit_is_imported_on_refresh() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("external.vault");
    let db = open(&path);
    let (seen, callback) = recorder();
    db.add_listener(callback).unwrap();

    let version = commit_from_outside(&temp_dir, &path, 3);
    assert!(version > db.latest_version().unwrap());

    assert!(db.refresh().unwrap());
    assert_eq!(db.version().unwrap(), version);
    assert_eq!(db.count("Note").unwrap(), 3);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, NotificationKind::ExternalChange);
    assert_eq!(seen[0].committer, None);
}

#[test]
fn test_external_commit_is_imported_before_writing() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("external_write.vault");
    let db = open(&path);
    db.set_auto_refresh(false).unwrap();

    let external = commit_from_outside(&temp_dir, &path, 2);
    let version = add_note(&db, "local");
    assert_eq!(version, external.next());
    assert_eq!(db.count("Note").unwrap(), 3);
}

#[test]
fn test_watcher_requires_runtime() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir.path().join("no_runtime.vault"));
    assert!(matches!(
        spawn_change_watcher(&db, Duration::from_millis(10)),
        Err(DbError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_run_until_delivers_commits_from_other_threads() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("async.vault");
    let context = ExecutionContext::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let db = {
        let _entered = context.enter();
        let db = open(&path);
        db.add_listener(move |notification| {
            let _ = tx.send(notification.clone());
        })
        .unwrap();
        db
    };

    let writer_path = path.clone();
    let committed = tokio::task::spawn_blocking(move || add_note(&open(&writer_path), "hello"))
        .await
        .unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(5), context.run_until(rx.recv()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.version, committed);
    assert_eq!(notification.kind, NotificationKind::DidChange);

    let _entered = context.enter();
    assert_eq!(db.version().unwrap(), committed);
}

#[tokio::test]
async fn test_watcher_imports_external_commits() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("watched.vault");
    let context = ExecutionContext::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let (db, watcher) = {
        let _entered = context.enter();
        let db = open(&path);
        db.add_listener(move |notification| {
            let _ = tx.send(notification.clone());
        })
        .unwrap();
        let watcher = spawn_change_watcher(&db, Duration::from_millis(10)).unwrap();
        (db, watcher)
    };

    let version = commit_from_outside(&temp_dir, &path, 2);
    let notification = tokio::time::timeout(Duration::from_secs(5), context.run_until(rx.recv()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.kind, NotificationKind::ExternalChange);
    assert_eq!(notification.version, version);

    watcher.stop().await.unwrap();
    let _entered = context.enter();
    assert_eq!(db.latest_version().unwrap(), version);
}
