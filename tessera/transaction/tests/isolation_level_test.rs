mod common;

use common::*;
use tessera_transaction::IsolationLevel;

// ========== DIRTY READ TESTS ==========

#[test]
fn test_only_read_uncommitted_sees_uncommitted_writes() {
    let (engine, storage) = create_engine();

    // Transaction 1 writes two keys but does not commit
    let t1 = engine.begin_transaction(false).unwrap();
    let map = open_test_map(&t1, &storage);
    map.clear().unwrap();
    map.put("1".into(), "a".into()).unwrap();
    map.put("2".into(), "b".into()).unwrap();

    // Only the READ_UNCOMMITTED reader sees them
    let t2 = begin(&engine, IsolationLevel::ReadUncommitted);
    let map = map.get_instance(&t2);
    assert_eq!(map.get(&"1".into()).unwrap(), s("a"));

    let t3 = begin(&engine, IsolationLevel::ReadCommitted);
    let map = map.get_instance(&t3);
    assert_eq!(map.get(&"1".into()).unwrap(), None);

    let t4 = begin(&engine, IsolationLevel::RepeatableRead);
    let map = map.get_instance(&t4);
    assert_eq!(map.get(&"1".into()).unwrap(), None);

    let t5 = begin(&engine, IsolationLevel::Serializable);
    let map = map.get_instance(&t5);
    assert_eq!(map.get(&"1".into()).unwrap(), None);
}

#[test]
fn test_uncommitted_update_hides_behind_committed_value() {
    let (engine, storage) = create_engine();
    seed(&engine, &storage, &[("k", "committed")]);

    // Transaction 1 overwrites the committed value
    let writer = engine.begin_transaction(false).unwrap();
    let map = open_test_map(&writer, &storage);
    map.put("k".into(), "dirty".into()).unwrap();

    for level in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ] {
        let reader = begin(&engine, level);
        let view = map.get_instance(&reader);
        assert_eq!(view.get(&"k".into()).unwrap(), s("committed"), "{level:?}");
    }

    let reader = begin(&engine, IsolationLevel::ReadUncommitted);
    assert_eq!(
        map.get_instance(&reader).get(&"k".into()).unwrap(),
        s("dirty")
    );
}

// ========== SNAPSHOT TESTS ==========

#[test]
fn test_snapshot_levels_ignore_later_commits() {
    let (engine, storage) = create_engine();

    // Transaction 1 commits the initial state
    let t1 = begin(&engine, IsolationLevel::ReadCommitted);
    let map1 = open_test_map(&t1, &storage);
    map1.clear().unwrap();
    assert_eq!(map1.get(&"1".into()).unwrap(), None);
    map1.put("2".into(), "b-old".into()).unwrap();
    map1.put("3".into(), "c".into()).unwrap();
    t1.commit().unwrap();

    // Transactions 2 and 3 take their snapshots
    let t2 = begin(&engine, IsolationLevel::RepeatableRead);
    let map2 = map1.get_instance(&t2);
    assert_eq!(map2.get(&"1".into()).unwrap(), None);
    assert_eq!(map2.get(&"3".into()).unwrap(), s("c"));

    let t3 = begin(&engine, IsolationLevel::Serializable);
    let map3 = map1.get_instance(&t3);
    assert_eq!(map3.get(&"1".into()).unwrap(), None);
    assert_eq!(map3.get(&"3".into()).unwrap(), s("c"));

    // Transaction 4 changes everything and commits
    let t4 = engine.begin_transaction(false).unwrap();
    let map4 = map1.get_instance(&t4);
    map4.put("1".into(), "a".into()).unwrap();
    map4.put("2".into(), "b-new".into()).unwrap();
    map4.remove(&"3".into()).unwrap();
    t4.commit().unwrap();

    // Transaction 1's map reads the latest committed data
    assert_eq!(map1.get(&"1".into()).unwrap(), s("a"));
    assert_eq!(map1.get(&"2".into()).unwrap(), s("b-new"));
    assert_eq!(map1.get(&"3".into()).unwrap(), None);

    // Transactions 2 and 3 keep their snapshots
    assert_eq!(map2.get(&"1".into()).unwrap(), None);
    assert_eq!(map3.get(&"1".into()).unwrap(), None);
    assert_eq!(map2.get(&"2".into()).unwrap(), s("b-old"));
    assert_eq!(map3.get(&"2".into()).unwrap(), s("b-old"));
    assert_eq!(map2.get(&"3".into()).unwrap(), s("c"));
    assert_eq!(map3.get(&"3".into()).unwrap(), s("c"));
}

#[test]
fn test_snapshot_excludes_writer_open_at_first_read() {
    let (engine, storage) = create_engine();
    seed(&engine, &storage, &[("k", "v1")]);

    // The writer starts before the reader
    let writer = engine.begin_transaction(false).unwrap();
    let reader = begin(&engine, IsolationLevel::RepeatableRead);
    let w = open_test_map(&writer, &storage);
    let r = w.get_instance(&reader);

    w.put("k".into(), "v2".into()).unwrap();
    assert_eq!(r.get(&"k".into()).unwrap(), s("v1"));

    // Even though its id is smaller, the writer was in flight at the first read
    writer.commit().unwrap();
    assert_eq!(r.get(&"k".into()).unwrap(), s("v1"));

    let entries: Vec<_> = r.entry_iterator(None).collect();
    assert_eq!(entries, vec![("k".to_string(), "v1".to_string())]);
}

// ========== READ COMMITTED TESTS ==========

#[test]
fn test_read_committed_sees_fresh_commits() {
    let (engine, storage) = create_engine();
    seed(&engine, &storage, &[("k", "v1")]);

    let reader = begin(&engine, IsolationLevel::ReadCommitted);
    let r = open_test_map(&reader, &storage);
    assert_eq!(r.get(&"k".into()).unwrap(), s("v1"));

    // Later transactions commit one after another; the reader sees each new value
    let mut previous = "v1";
    for value in ["v2", "v3"] {
        let writer = engine.begin_transaction(false).unwrap();
        let w = r.get_instance(&writer);
        w.put("k".into(), value.into()).unwrap();
        assert_eq!(r.get(&"k".into()).unwrap(), s(previous));
        writer.commit().unwrap();
        assert_eq!(r.get(&"k".into()).unwrap(), s(value));
        previous = value;
    }
}

#[test]
fn test_rolled_back_writes_are_never_seen() {
    let (engine, storage) = create_engine();
    seed(&engine, &storage, &[("k", "v1")]);

    let writer = engine.begin_transaction(false).unwrap();
    let w = open_test_map(&writer, &storage);
    w.put("k".into(), "v2".into()).unwrap();
    w.put("new".into(), "x".into()).unwrap();
    writer.rollback().unwrap();

    for level in [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
    ] {
        let reader = begin(&engine, level);
        let r = w.get_instance(&reader);
        assert_eq!(r.get(&"k".into()).unwrap(), s("v1"));
        assert_eq!(r.get(&"new".into()).unwrap(), None);
    }
    assert_eq!(w.raw_size(), 1);
}
