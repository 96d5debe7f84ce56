mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use rand::Rng;
use tessera_transaction::{
    Completion, EngineConfig, ErrorCode, Listener, SyncListener, TransactionMap,
};

const THREADS: usize = 8;
const COUNTER_MAP: &str = "counters";

// ========== WRITE CONFLICT TESTS ==========

#[test]
fn test_exactly_one_writer_wins_each_round() {
    let (engine, storage) = create_engine();
    let key = "hot".to_string();

    for round in 0..20 {
        let barrier = Barrier::new(THREADS);
        let winners = AtomicUsize::new(0);
        thread::scope(|scope| {
            for i in 0..THREADS {
                let (engine, storage, barrier, winners, key) =
                    (&engine, &storage, &barrier, &winners, &key);
                scope.spawn(move || {
                    let txn = engine.begin_transaction(false).unwrap();
                    let map = open_test_map(&txn, storage);
                    let (_, seen) = map.get_value_and_ref(key).unwrap();
                    barrier.wait();

                    let value = format!("{round}-{i}");
                    if map.try_update(key.clone(), value, None, seen).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        txn.commit().unwrap();
                    } else {
                        txn.rollback().unwrap();
                    }
                });
            }
        });
        assert_eq!(winners.load(Ordering::SeqCst), 1, "round {round}");
    }

    let reader = engine.begin_transaction(false).unwrap();
    let map = open_test_map(&reader, &storage);
    let last = map.get(&key).unwrap().unwrap();
    assert!(last.starts_with("19-"));
    assert_eq!(engine.open_transaction_count(), 1);
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    const INCREMENTS: usize = 50;
    const KEYS: [&str; 3] = ["a", "b", "c"];

    let (engine, storage) = create_engine();
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let mut rng = rand::rng();
                for _ in 0..INCREMENTS {
                    let key = KEYS[rng.random_range(0..KEYS.len())].to_string();
                    // Retry until the read-modify-write lands on an unchanged head
                    loop {
                        let txn = engine.begin_transaction(false).unwrap();
                        let map: TransactionMap<String, u64> =
                            txn.open_map(COUNTER_MAP, &storage).unwrap();
                        let (value, seen) = map.get_value_and_ref(&key).unwrap();
                        let next = value.unwrap_or(0) + 1;
                        if map.try_update(key.clone(), next, None, seen).unwrap() {
                            txn.commit().unwrap();
                            break;
                        }
                        txn.rollback().unwrap();
                        thread::yield_now();
                    }
                }
            });
        }
    });

    let reader = engine.begin_transaction(false).unwrap();
    let map: TransactionMap<String, u64> = reader.open_map(COUNTER_MAP, &storage).unwrap();
    let total: u64 = map.entry_iterator(None).map(|(_, v)| v).sum();
    assert_eq!(total, (THREADS * INCREMENTS) as u64);
}

#[test]
fn test_concurrent_inserts_of_one_key_admit_one() {
    let (engine, storage) = create_engine();
    let completed = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for i in 0..THREADS {
            let (engine, storage, completed, barrier) = (&engine, &storage, &completed, &barrier);
            scope.spawn(move || {
                let txn = engine.begin_transaction(false).unwrap();
                let map = open_test_map(&txn, storage);
                barrier.wait();

                let listener = Arc::new(SyncListener::new());
                map.add_if_absent("unique".into(), format!("v{i}"), listener.clone())
                    .unwrap();
                match listener.await_completion() {
                    Ok(()) => {
                        assert_eq!(listener.completion(), Some(Completion::Complete));
                        completed.fetch_add(1, Ordering::SeqCst);
                        txn.commit().unwrap();
                    }
                    Err(e) => {
                        assert_eq!(e.code(), ErrorCode::DuplicateKey);
                        txn.rollback().unwrap();
                    }
                }
            });
        }
    });

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    let reader = engine.begin_transaction(false).unwrap();
    assert_eq!(open_test_map(&reader, &storage).size(), 1);
}

// ========== LIMIT TESTS ==========

#[test]
fn test_open_transaction_limit() {
    let config = EngineConfig {
        max_open_transactions: 4,
        ..EngineConfig::default()
    };
    let (engine, _storage) = create_engine_with(config);
    let open: Vec<_> = (0..4)
        .map(|_| engine.begin_transaction(false).unwrap())
        .collect();

    let err = engine.begin_transaction(false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TooManyOpenTransactions);
    assert_eq!(err.code().as_u32(), 102);

    open[0].commit().unwrap();
    assert!(engine.begin_transaction(false).is_ok());
}
