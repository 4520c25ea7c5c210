use rusqlite::Connection;
use std::sync::{Arc, Barrier};
use std::thread;
use wikistore_core::{
    ArchiveKey, Document, DocumentArchive, StoreContext, StoreError, StoreSettings, Version,
    VersionedDocument, WikiStore,
};

fn open_store(dir: &tempfile::TempDir) -> WikiStore {
    WikiStore::open(StoreSettings {
        data_dir: dir.path().to_path_buf(),
        ..StoreSettings::default()
    })
    .unwrap()
}

fn archive_rows(dir: &tempfile::TempDir, tenant: &str, full_name: &str) -> i64 {
    let conn = Connection::open(dir.path().join(format!("{tenant}.sqlite3"))).unwrap();
    conn.query_row(
        "SELECT count(*) FROM wikiarchive WHERE fullname = ?1",
        [full_name],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn first_access_persists_an_empty_archive() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let doc = Document::new("Main", "Fresh");

    let archive = store.get_document_archive(&doc, &mut ctx).unwrap();

    assert!(archive.is_empty());
    assert!(archive.is_persisted());
    assert_eq!(archive.key(), &ArchiveKey::new("acme", "Main.Fresh"));
    assert_eq!(archive_rows(&dir, "acme", "Main.Fresh"), 1);
    assert!(store.list_versions(&doc, &mut ctx).unwrap().is_empty());
}

#[test]
fn appended_revision_reads_back_its_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let doc = Document::new("Main", "WebHome").with_author("alice");

    let version = store
        .append_revision(&doc, "v1 content", true, &mut ctx)
        .unwrap();
    assert_eq!(version, Version::INITIAL);
    assert_eq!(
        store.list_versions(&doc, &mut ctx).unwrap(),
        vec![Version::INITIAL]
    );

    let loaded = store.load_at_version(&doc, "1.1", &mut ctx).unwrap();
    assert!(loaded.is_loaded());
    let loaded = loaded.into_document();
    assert_eq!(loaded.content, "v1 content");
    assert_eq!(loaded.author, "alice");
    assert_eq!(loaded.version, "1.1");
    assert_eq!(loaded.full_name(), "Main.WebHome");
}

#[test]
fn versions_are_listed_in_change_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let doc = Document::new("Main", "WebHome");

    for text in ["r1", "r2", "r3"] {
        store.append_revision(&doc, text, true, &mut ctx).unwrap();
    }

    // A fresh context reads from storage, not from its cache.
    let mut fresh = StoreContext::for_tenant("acme");
    assert_eq!(
        store.list_versions(&doc, &mut fresh).unwrap(),
        vec![Version::new(1, 1), Version::new(1, 2), Version::new(1, 3)]
    );
    let second = store.load_at_version(&doc, "1.2", &mut fresh).unwrap();
    assert_eq!(second.document().content, "r2");
}

#[test]
fn unknown_version_names_document_and_label() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let doc = Document::new("Main", "WebHome");
    store.append_revision(&doc, "r1", true, &mut ctx).unwrap();

    let err = store.load_at_version(&doc, "99.99", &mut ctx).unwrap_err();

    match err {
        StoreError::UnexistantVersion { document, version } => {
            assert_eq!(document, "Main.WebHome");
            assert_eq!(version, "99.99");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn branch_label_resolves_without_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let doc = Document::new("Main", "WebHome").in_tenant("acme");
    store.append_revision(&doc, "r1", true, &mut ctx).unwrap();
    store.append_revision(&doc, "r2", true, &mut ctx).unwrap();

    match store.load_at_version(&doc, "1", &mut ctx).unwrap() {
        VersionedDocument::ContentUnavailable {
            requested,
            resolved,
            stub,
        } => {
            assert_eq!(requested, "1");
            assert_eq!(resolved, Version::new(1, 2));
            assert_eq!(stub.version, "1");
            assert_eq!(stub.tenant.as_deref(), Some("acme"));
            assert!(stub.content.is_empty());
        }
        other => panic!("expected a stub, got {other:?}"),
    }
}

#[test]
fn concurrent_first_access_creates_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open_store(&dir));
    let mut init = StoreContext::for_tenant("acme");
    store.ensure_initialized(&mut init).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = StoreContext::for_tenant("acme");
                let doc = Document::new("Main", "Racy");
                barrier.wait();
                store.get_document_archive(&doc, &mut ctx).unwrap()
            })
        })
        .collect();
    let archives: Vec<DocumentArchive> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert!(archives.iter().all(DocumentArchive::is_empty));
    assert_eq!(archive_rows(&dir, "acme", "Main.Racy"), 1);
    assert_eq!(store.archives().active_locks(), 0);
}

#[test]
fn archives_are_isolated_per_tenant() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let doc = Document::new("Main", "WebHome");
    let mut acme = StoreContext::for_tenant("acme");
    let mut beta = StoreContext::for_tenant("beta");

    store.append_revision(&doc, "acme text", true, &mut acme).unwrap();
    store.append_revision(&doc, "beta one", true, &mut beta).unwrap();
    store.append_revision(&doc, "beta two", true, &mut beta).unwrap();

    assert_eq!(store.list_versions(&doc, &mut acme).unwrap().len(), 1);
    assert_eq!(store.list_versions(&doc, &mut beta).unwrap().len(), 2);
    let acme_doc = store.load_at_version(&doc, "1.1", &mut acme).unwrap();
    assert_eq!(acme_doc.document().content, "acme text");
}

#[test]
fn document_tenant_overrides_ambient_tenant() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let doc = Document::new("Main", "Shared").in_tenant("beta");

    store.append_revision(&doc, "in beta", true, &mut ctx).unwrap();

    assert_eq!(ctx.tenant(), Some("acme"));
    assert_eq!(archive_rows(&dir, "beta", "Main.Shared"), 1);
}

#[test]
fn document_tenant_cannot_be_reached_from_an_open_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .ensure_initialized(&mut StoreContext::for_tenant("beta"))
        .unwrap();
    let mut ctx = StoreContext::for_tenant("acme");
    store.begin_transaction(&mut ctx).unwrap();
    let doc = Document::new("Main", "Elsewhere").in_tenant("beta");

    let err = store
        .append_revision(&doc, "lost?", false, &mut ctx)
        .unwrap_err();

    assert!(matches!(err, StoreError::SwitchDatabase { ref tenant, .. } if tenant == "beta"));
    assert_eq!(ctx.tenant(), Some("acme"));
    store.end_transaction(&mut ctx, true).unwrap();
    assert_eq!(archive_rows(&dir, "beta", "Main.Elsewhere"), 0);
    assert_eq!(archive_rows(&dir, "acme", "Main.Elsewhere"), 0);
    assert_eq!(store.open_connections(), 0);
}

#[test]
fn document_tenant_is_reached_from_a_held_autocommit_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    store.ensure_initialized(&mut ctx).unwrap();
    store
        .ensure_initialized(&mut StoreContext::for_tenant("beta"))
        .unwrap();
    store
        .transactions()
        .begin_transaction(None, false, &mut ctx)
        .unwrap();
    let doc = Document::new("Main", "Elsewhere").in_tenant("beta");

    store.append_revision(&doc, "in beta", false, &mut ctx).unwrap();

    assert_eq!(store.open_connections(), 1);
    store.end_transaction(&mut ctx, true).unwrap();
    assert_eq!(store.open_connections(), 0);
    assert_eq!(archive_rows(&dir, "beta", "Main.Elsewhere"), 1);
    assert_eq!(archive_rows(&dir, "acme", "Main.Elsewhere"), 0);
}

#[test]
fn appends_from_two_contexts_are_both_kept() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let doc = Document::new("Main", "WebHome");
    let mut a = StoreContext::for_tenant("acme");
    let mut b = StoreContext::for_tenant("acme");

    assert!(store.get_document_archive(&doc, &mut a).unwrap().is_empty());
    store.append_revision(&doc, "from b", true, &mut b).unwrap();
    let version = store.append_revision(&doc, "from a", true, &mut a).unwrap();

    assert_eq!(version, Version::new(1, 2));
    let mut fresh = StoreContext::for_tenant("acme");
    assert_eq!(
        store.list_versions(&doc, &mut fresh).unwrap(),
        vec![Version::new(1, 1), Version::new(1, 2)]
    );
    let first = store.load_at_version(&doc, "1.1", &mut fresh).unwrap();
    assert_eq!(first.document().content, "from b");
}

#[test]
fn append_after_the_last_minor_version_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let mut doc = Document::new("Main", "WebHome").with_content("top");
    doc.version = "1.4294967295".to_string();
    store.reset_archive(&doc, true, &mut ctx).unwrap();

    let err = store
        .append_revision(&doc, "one more", true, &mut ctx)
        .unwrap_err();

    match err {
        StoreError::SavingArchive { document, source } => {
            assert_eq!(document, "Main.WebHome");
            assert!(matches!(*source, StoreError::VersionOverflow { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!ctx.has_session());
    let mut fresh = StoreContext::for_tenant("acme");
    assert_eq!(
        store.list_versions(&doc, &mut fresh).unwrap(),
        vec![Version::new(1, u32::MAX)]
    );
}

#[test]
fn each_tenant_is_synchronized_on_first_use() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.ensure_initialized(&mut StoreContext::new()).unwrap();

    let mut gamma = StoreContext::for_tenant("gamma");
    let version = store
        .append_revision(&Document::new("Main", "WebHome"), "hello", true, &mut gamma)
        .unwrap();
    let mut main = StoreContext::new();
    store
        .append_revision(
            &Document::new("Main", "Other").in_tenant("delta"),
            "hi",
            true,
            &mut main,
        )
        .unwrap();

    assert_eq!(version, Version::INITIAL);
    assert_eq!(archive_rows(&dir, "gamma", "Main.WebHome"), 1);
    assert_eq!(archive_rows(&dir, "delta", "Main.Other"), 1);
    assert_eq!(store.synchronized_tenants(), vec!["delta", "gamma", "main"]);
}

#[test]
fn archived_snapshot_round_trips_through_a_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let mut doc = Document::new("Blog", "Post")
        .with_author("bob")
        .with_content("first draft");
    doc.language = "en".to_string();

    let version = store.archive_document(&doc, true, &mut ctx).unwrap();

    let loaded = store
        .load_at_version(&doc, &version.to_string(), &mut ctx)
        .unwrap()
        .into_document();
    assert_eq!(loaded.content, "first draft");
    assert_eq!(loaded.language, "en");
    assert_eq!(loaded.author, "bob");
    assert_eq!(loaded.version, "1.1");
}

#[test]
fn reset_keeps_a_single_revision() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let mut doc = Document::new("Main", "WebHome").with_content("latest");
    for text in ["r1", "r2"] {
        store.append_revision(&doc, text, true, &mut ctx).unwrap();
    }
    doc.version = "2.4".to_string();

    let archive = store.reset_archive(&doc, true, &mut ctx).unwrap();

    assert_eq!(archive.versions(), vec![Version::new(2, 4)]);
    let mut fresh = StoreContext::for_tenant("acme");
    assert_eq!(
        store.list_versions(&doc, &mut fresh).unwrap(),
        vec![Version::new(2, 4)]
    );
    let loaded = store.load_at_version(&doc, "2.4", &mut fresh).unwrap();
    assert_eq!(loaded.document().content, "latest");
}

#[test]
fn load_archive_of_missing_row_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    let mut archive = DocumentArchive::new(ArchiveKey::new("acme", "Main.Nothing"));

    store.load_archive(&mut archive, true, &mut ctx).unwrap();

    assert!(archive.is_empty());
    assert!(!archive.is_persisted());
    assert_eq!(archive_rows(&dir, "acme", "Main.Nothing"), 0);
}

#[test]
fn corrupt_archive_is_reported_as_a_read_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut ctx = StoreContext::for_tenant("acme");
    store.ensure_initialized(&mut ctx).unwrap();
    Connection::open(dir.path().join("acme.sqlite3"))
        .unwrap()
        .execute(
            "INSERT INTO wikiarchive (fullname, archive) VALUES ('Main.Broken', 'not json')",
            [],
        )
        .unwrap();

    let err = store
        .get_document_archive(&Document::new("Main", "Broken"), &mut ctx)
        .unwrap_err();

    assert!(matches!(err, StoreError::ReadingArchive { ref document, .. } if document == "Main.Broken"));
    assert!(!ctx.has_session());
}
