//! # Schema Integration Tests
//!
//! Object creation through a real connection: file ids, exclusivity, compound
//! creates backing out on failure, and the three import flows.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use tierdb_core::{ConfigString, Error, Result};
use tierdb_storage::{Connection, DataSource};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn quoted(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

fn file_id(conn: &Connection, uri: &str) -> i64 {
    let cfg = ConfigString::parse(&conn.metadata_search(uri).unwrap()).unwrap();
    cfg.get_int("id").unwrap()
}

/// Build a table `x` in `home`, write rows and checkpoint it, returning the
/// metadata of its data file.
fn build_source_table(home: &Path, stop_ts: Option<u64>) -> String {
    let conn = Connection::open(home, "").unwrap();
    let mut session = conn.open_session();
    session.create("table:x", "key_format=S,value_format=S").unwrap();
    session.insert("table:x", strings(&["a"]), strings(&["1"]), 100).unwrap();
    session.insert("table:x", strings(&["b"]), strings(&["2"]), 200).unwrap();
    if let Some(ts) = stop_ts {
        session.remove("table:x", &strings(&["b"]), ts).unwrap();
    }
    session.checkpoint().unwrap();
    let filecfg = conn.metadata_search("file:x.wt").unwrap();
    conn.close().unwrap();
    filecfg
}

#[test]
fn test_create_file_assigns_fresh_id() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "").unwrap();
    let mut session = conn.open_session();

    session.create("file:t1", "allocation_size=4096").unwrap();
    session.create("file:t2", "").unwrap();

    let cfg = ConfigString::parse(&conn.metadata_search("file:t1").unwrap()).unwrap();
    assert_eq!(cfg.get_int("allocation_size"), Some(4096));
    assert_eq!(file_id(&conn, "file:t1"), 1);
    assert_eq!(file_id(&conn, "file:t2"), 2);
    assert!(dir.path().join("t1").exists());
    assert_eq!(conn.stats().creates, 2);
}

#[test]
fn test_exclusive_create_of_existing_file() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "").unwrap();
    let mut session = conn.open_session();

    session.create("file:t1", "allocation_size=4096").unwrap();
    let before = conn.metadata_search("file:t1").unwrap();

    // Without exclusive an existing object is left alone.
    session.create("file:t1", "allocation_size=8192").unwrap();
    let err = session.create("file:t1", "exclusive=true").unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert_eq!(err.status(), tierdb_core::error::EEXIST);
    assert_eq!(conn.metadata_search("file:t1").unwrap(), before);
}

#[test]
fn test_direct_io_allocation_size_check() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "direct_io=true,buffer_alignment=4096").unwrap();
    let mut session = conn.open_session();

    let err = session.create("file:bad", "allocation_size=6144").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(conn.metadata_search("file:bad").is_err());

    session.create("file:good", "allocation_size=8192").unwrap();
}

#[test]
fn test_table_create_backs_out_when_source_fails() {
    let dir = TempDir::new().unwrap();
    // A stray data file makes the column group's source creation fail.
    fs::write(dir.path().join("t.wt"), b"stray").unwrap();

    let conn = Connection::open(dir.path(), "").unwrap();
    let mut session = conn.open_session();
    assert!(session.create("table:t", "key_format=S,value_format=S").is_err());

    assert!(conn.metadata_list().is_empty());
    assert_eq!(fs::read(dir.path().join("t.wt")).unwrap(), b"stray");

    fs::remove_file(dir.path().join("t.wt")).unwrap();
    session.create("table:t", "key_format=S,value_format=S").unwrap();
    assert!(conn.metadata_search("colgroup:t").is_ok());
    assert!(conn.metadata_search("file:t.wt").is_ok());
}

struct FailingSource;

impl DataSource for FailingSource {
    fn create(&self, uri: &str, _config: &ConfigString) -> Result<()> {
        Err(Error::invalid(format!("{}: refused", uri)))
    }
}

#[test]
fn test_second_colgroup_failure_leaves_first() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "").unwrap();
    conn.register_data_source("fail", Arc::new(FailingSource)).unwrap();
    let mut session = conn.open_session();

    session
        .create("table:t", "key_format=S,value_format=SS,columns=(k,a,b),colgroups=(c1,c2)")
        .unwrap();
    session.create("colgroup:t:c1", "columns=(a)").unwrap();
    assert!(session.create("colgroup:t:c2", "columns=(b),type=fail").is_err());

    let uris: Vec<String> = conn.metadata_list().into_iter().map(|(k, _)| k).collect();
    assert_eq!(uris, strings(&["colgroup:t:c1", "file:t_c1.wt", "table:t"]));
    assert!(!dir.path().join("t_c2.wt").exists());
}

#[test]
fn test_colgroups_split_values() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "").unwrap();
    let mut session = conn.open_session();
    session
        .create("table:t", "key_format=S,value_format=SS,columns=(k,a,b),colgroups=(c1,c2)")
        .unwrap();
    session.create("colgroup:t:c1", "columns=(a)").unwrap();

    // Writes need every column group.
    assert!(session.insert("table:t", strings(&["k"]), strings(&["x", "y"]), 1).is_err());

    session.create("colgroup:t:c2", "columns=(b)").unwrap();
    session.insert("table:t", strings(&["k"]), strings(&["x", "y"]), 1).unwrap();
    assert_eq!(session.get("table:t", &strings(&["k"])).unwrap(), Some(strings(&["x", "y"])));
}

#[test]
fn test_index_backfill_and_validation() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "").unwrap();
    let mut session = conn.open_session();
    session
        .create("table:people", "key_format=S,value_format=SS,columns=(id,name,city)")
        .unwrap();
    session
        .insert("table:people", strings(&["1"]), strings(&["ann", "oslo"]), 10)
        .unwrap();
    session
        .insert("table:people", strings(&["2"]), strings(&["bob", "lima"]), 20)
        .unwrap();

    session.create("index:people:city", "columns=(city)").unwrap();
    assert_eq!(
        session.index_scan("index:people:city").unwrap(),
        vec![strings(&["lima", "2"]), strings(&["oslo", "1"])]
    );
    let cfg = ConfigString::parse(&conn.metadata_search("index:people:city").unwrap()).unwrap();
    assert_eq!(cfg.get_str("source").as_deref(), Some("file:people_city.wti"));
    assert_eq!(cfg.get_str("key_format").as_deref(), Some("SS"));

    let err = session.create("index:missing:city", "columns=(city)").unwrap_err();
    assert!(matches!(err, Error::NoEntry { .. }));
    let err = session.create("index:people", "columns=(city)").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    let err = session.create("index:people:city", "columns=(city),exclusive=true").unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
}

#[test]
fn test_index_on_simple_table_rejected() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "").unwrap();
    let mut session = conn.open_session();
    session.create("table:s", "key_format=S,value_format=S").unwrap();
    let err = session.create("index:s:i", "columns=(a)").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(conn.metadata_search("index:s:i").is_err());
}

#[test]
fn test_lsm_tree_gets_first_chunk() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path(), "").unwrap();
    let mut session = conn.open_session();
    session.create("lsm:tree", "key_format=S,value_format=S").unwrap();

    let cfg = ConfigString::parse(&conn.metadata_search("lsm:tree").unwrap()).unwrap();
    assert_eq!(cfg.get_int("last"), Some(1));
    assert!(conn.metadata_search("file:tree-000001.lsm").is_ok());
    session.create("lsm:tree", "").unwrap();
    assert!(session.create("lsm:tree", "exclusive=true").is_err());
}

#[test]
fn test_rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    build_source_table(dir.path(), None);

    let conn = Connection::open(dir.path(), "").unwrap();
    let session = conn.open_session();
    assert_eq!(
        session.scan("table:x").unwrap(),
        vec![(strings(&["a"]), strings(&["1"])), (strings(&["b"]), strings(&["2"]))]
    );
}

#[test]
fn test_import_refused_past_oldest_timestamp() {
    let src = TempDir::new().unwrap();
    let filecfg = build_source_table(src.path(), Some(500));

    let dst = TempDir::new().unwrap();
    fs::copy(src.path().join("x.wt"), dst.path().join("x.wt")).unwrap();
    let conn = Connection::open(dst.path(), "").unwrap();
    conn.set_stable_timestamp(400).unwrap();
    conn.set_oldest_timestamp(400).unwrap();
    let mut session = conn.open_session();

    let config = format!("import=(enabled=true,file_metadata=({}))", filecfg);
    let err = session.create("file:x.wt", &config).unwrap_err();
    assert!(matches!(err, Error::Rollback { .. }));
    assert_eq!(err.status(), tierdb_core::error::WT_ROLLBACK);
    assert!(conn.metadata_list().is_empty());
    // The imported file is not ours to remove.
    assert!(dst.path().join("x.wt").exists());

    // Comparing against stable (still 400) is refused as well.
    let stable = format!(
        "import=(enabled=true,compare_timestamp=stable,file_metadata=({}))",
        filecfg
    );
    assert!(matches!(session.create("file:x.wt", &stable), Err(Error::Rollback { .. })));

    conn.set_stable_timestamp(500).unwrap();
    conn.set_oldest_timestamp(500).unwrap();
    session.create("file:x.wt", &config).unwrap();
    assert!(conn.metadata_search("file:x.wt").is_ok());
    assert_eq!(conn.stats().imports, 1);
}

#[test]
fn test_import_keeps_exported_allocation_size() {
    let src = TempDir::new().unwrap();
    let filecfg = {
        let conn = Connection::open(src.path(), "").unwrap();
        let mut session = conn.open_session();
        session.create("file:a.wt", "allocation_size=512").unwrap();
        session.checkpoint().unwrap();
        let cfg = conn.metadata_search("file:a.wt").unwrap();
        conn.close().unwrap();
        cfg
    };
    let exported = ConfigString::parse(&filecfg).unwrap();
    assert_eq!(exported.get_int("allocation_size"), Some(512));

    let dst = TempDir::new().unwrap();
    fs::copy(src.path().join("a.wt"), dst.path().join("a.wt")).unwrap();
    let conn = Connection::open(dst.path(), "").unwrap();
    let mut session = conn.open_session();
    let config = format!("import=(enabled=true,file_metadata=({}))", filecfg);
    session.create("file:a.wt", &config).unwrap();

    let imported = ConfigString::parse(&conn.metadata_search("file:a.wt").unwrap()).unwrap();
    assert_eq!(imported.get_int("allocation_size"), Some(512));
}

#[test]
fn test_import_needs_metadata_or_repair() {
    let src = TempDir::new().unwrap();
    build_source_table(src.path(), None);

    let dst = TempDir::new().unwrap();
    fs::copy(src.path().join("x.wt"), dst.path().join("x.wt")).unwrap();
    let conn = Connection::open(dst.path(), "").unwrap();
    let mut session = conn.open_session();

    let err = session.create("file:x.wt", "import=(enabled=true)").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    let err = session.create("file:nope.wt", "import=(enabled=true,repair=true)").unwrap_err();
    assert!(matches!(err, Error::NoEntry { .. }));
    let err = session.create("lsm:x", "import=(enabled=true,repair=true)").unwrap_err();
    assert!(matches!(err, Error::NotSupported { .. }));
}

#[test]
fn test_import_table_with_repair() {
    let src = TempDir::new().unwrap();
    build_source_table(src.path(), None);

    let dst = TempDir::new().unwrap();
    fs::copy(src.path().join("x.wt"), dst.path().join("x.wt")).unwrap();
    let conn = Connection::open(dst.path(), "").unwrap();
    conn.set_stable_timestamp(1000).unwrap();
    conn.set_oldest_timestamp(1000).unwrap();
    let mut session = conn.open_session();

    session.create("table:x", "import=(enabled=true,repair=true)").unwrap();
    for uri in ["table:x", "colgroup:x", "file:x.wt"] {
        assert!(conn.metadata_search(uri).is_ok(), "{} missing", uri);
    }
    let table = ConfigString::parse(&conn.metadata_search("table:x").unwrap()).unwrap();
    assert_eq!(table.get_str("value_format").as_deref(), Some("S"));
    assert_eq!(session.scan("table:x").unwrap().len(), 2);
}

#[test]
fn test_import_table_from_metadata_file() {
    let src = TempDir::new().unwrap();
    {
        let conn = Connection::open(src.path(), "").unwrap();
        let mut session = conn.open_session();
        session.create("file:pad.wt", "").unwrap();
        session
            .create("table:y", "key_format=S,value_format=S,columns=(k,v)")
            .unwrap();
        session.insert("table:y", strings(&["k1"]), strings(&["v1"]), 5).unwrap();
        session.checkpoint().unwrap();
        assert_eq!(conn.export_metadata(src.path().join("export.txt")).unwrap(), 4);
    }
    let src_id = {
        let conn = Connection::open(src.path(), "").unwrap();
        file_id(&conn, "file:y.wt")
    };

    let dst = TempDir::new().unwrap();
    fs::copy(src.path().join("y.wt"), dst.path().join("y.wt")).unwrap();
    let conn = Connection::open(dst.path(), "").unwrap();
    let mut session = conn.open_session();
    session.create("file:other1.wt", "").unwrap();
    session.create("file:other2.wt", "").unwrap();

    let config = format!(
        "import=(enabled=true,metadata_file={})",
        quoted(&src.path().join("export.txt"))
    );
    session.create("table:y", &config).unwrap();

    // The exported id was remapped past the destination's own files.
    assert_eq!(src_id, 2);
    assert_eq!(file_id(&conn, "file:y.wt"), 3);
    assert!(conn.metadata_search("file:pad.wt").is_err());
    assert_eq!(
        session.scan("table:y").unwrap(),
        vec![(strings(&["k1"]), strings(&["v1"]))]
    );

    // Importing over an existing table is refused.
    let err = session.create("table:y", &config).unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
}
