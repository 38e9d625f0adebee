use bson::rawdoc;
use docshard::{CoalescerConfig, DocshardError, QueryCoalescer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

/// Ten concurrent callers for one namespace land within a single query's
/// latency: almost all of them must ride the leader's result.
#[test]
fn concurrent_requests_coalesce_to_few_queries() {
    let coalescer: QueryCoalescer<bson::RawDocumentBuf> = QueryCoalescer::new();
    let executions = AtomicUsize::new(0);
    let barrier = Barrier::new(10);

    let expected = vec![rawdoc! { "_id": 1 }, rawdoc! { "_id": 2 }];
    thread::scope(|scope| {
        for i in 0..10u64 {
            let coalescer = &coalescer;
            let executions = &executions;
            let barrier = &barrier;
            let expected = expected.clone();
            scope.spawn(move || {
                barrier.wait();
                let result = coalescer
                    .try_coalesce("testdb.testcoll", 1000 + i, || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(expected.clone())
                    })
                    .expect("coalesced query");
                // Every waiter observes byte-identical rows.
                assert_eq!(result.len(), 2);
                for (row, want) in result.iter().zip(&expected) {
                    assert_eq!(row.as_bytes(), want.as_bytes());
                }
            });
        }
    });

    assert!(executions.load(Ordering::SeqCst) <= 3);

    let stats = coalescer.get_stats();
    assert_eq!(stats.total_requests, 10);
    assert!(stats.coalesced_requests >= 7);
    assert!(stats.actual_queries <= 3);
    assert_eq!(
        stats.total_requests,
        stats.actual_queries + stats.coalesced_requests + stats.timeout_requests
    );
    assert_eq!(stats.active_groups, 0);
    assert!(stats.coalescing_rate >= 0.7);
}

/// A request whose version is too far from the group's runs independently
/// instead of waiting for a result it cannot use.
#[test]
fn distant_version_opts_out_of_the_group() {
    let coalescer: QueryCoalescer<i64> = QueryCoalescer::new();
    let executions = AtomicUsize::new(0);

    thread::scope(|scope| {
        let coalescer = &coalescer;
        let executions = &executions;
        scope.spawn(move || {
            coalescer
                .try_coalesce("testdb.testcoll", 1000, || {
                    executions.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(80));
                    Ok(vec![1])
                })
                .expect("leader query");
        });

        // Let the leader install its group first.
        thread::sleep(Duration::from_millis(20));
        let result = coalescer
            .try_coalesce("testdb.testcoll", 1_000_000, || {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(vec![2])
            })
            .expect("independent query");
        assert_eq!(*result, vec![2]);
    });

    assert_eq!(executions.load(Ordering::SeqCst), 2);
    let stats = coalescer.get_stats();
    assert_eq!(stats.actual_queries, 2);
    assert_eq!(stats.version_gap_skipped_requests, 1);
    assert_eq!(stats.coalesced_requests, 0);
    assert_eq!(
        stats.total_requests,
        stats.actual_queries + stats.coalesced_requests + stats.timeout_requests
    );
}

/// A full group pushes additional callers onto the independent path.
#[test]
fn full_group_overflows_to_independent_queries() {
    let config = CoalescerConfig {
        max_waiters_per_group: 1,
        ..CoalescerConfig::default()
    };
    let coalescer: QueryCoalescer<i64> = QueryCoalescer::with_config(config);

    thread::scope(|scope| {
        let coalescer = &coalescer;
        scope.spawn(move || {
            coalescer
                .try_coalesce("testdb.testcoll", 1, || {
                    thread::sleep(Duration::from_millis(80));
                    Ok(vec![1])
                })
                .expect("leader query");
        });

        thread::sleep(Duration::from_millis(20));
        let result = coalescer
            .try_coalesce("testdb.testcoll", 2, || Ok(vec![2]))
            .expect("overflow query");
        assert_eq!(*result, vec![2]);
    });

    let stats = coalescer.get_stats();
    assert_eq!(stats.overflow_requests, 1);
    assert_eq!(stats.actual_queries, 2);
}

/// A follower whose total budget elapses abandons the wait with a deadline
/// error while the leader still completes.
#[test]
fn follower_times_out_on_slow_leader() {
    let config = CoalescerConfig {
        max_wait: Duration::from_millis(10),
        max_total_wait: Duration::from_millis(50),
        ..CoalescerConfig::default()
    };
    let coalescer: QueryCoalescer<i64> = QueryCoalescer::with_config(config);

    thread::scope(|scope| {
        let coalescer = &coalescer;
        scope.spawn(move || {
            let result = coalescer.try_coalesce("testdb.testcoll", 1, || {
                thread::sleep(Duration::from_millis(250));
                Ok(vec![1])
            });
            assert!(result.is_ok());
        });

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        let err = coalescer
            .try_coalesce("testdb.testcoll", 2, || Ok(vec![2]))
            .expect_err("follower should time out");
        assert!(matches!(err, DocshardError::DeadlineExceeded(_)));
        assert!(start.elapsed() < Duration::from_millis(200));
    });

    let stats = coalescer.get_stats();
    assert_eq!(stats.timeout_requests, 1);
    assert_eq!(
        stats.total_requests,
        stats.actual_queries + stats.coalesced_requests + stats.timeout_requests
    );
}

/// Shutdown mid-flight delivers a shutdown status to the leader and every
/// queued waiter through the co-owned waiter state.
#[test]
fn shutdown_fans_out_to_waiting_callers() {
    let coalescer: QueryCoalescer<i64> = QueryCoalescer::new();

    thread::scope(|scope| {
        let coalescer = &coalescer;
        scope.spawn(move || {
            let result = coalescer.try_coalesce("testdb.testcoll", 1, || {
                thread::sleep(Duration::from_millis(120));
                Ok(vec![1])
            });
            assert!(matches!(
                result,
                Err(DocshardError::ShutdownInProgress(_))
            ));
        });
        scope.spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let result = coalescer.try_coalesce("testdb.testcoll", 2, || Ok(vec![2]));
            assert!(matches!(
                result,
                Err(DocshardError::ShutdownInProgress(_))
            ));
        });

        thread::sleep(Duration::from_millis(50));
        coalescer.shutdown();
    });

    assert!(coalescer.is_shutdown());
    let err = coalescer
        .try_coalesce("testdb.testcoll", 3, || Ok(vec![3]))
        .expect_err("post-shutdown call");
    assert!(matches!(err, DocshardError::ShutdownInProgress(_)));
}

/// A query failure reaches every waiter of the group verbatim.
#[test]
fn query_failure_fans_out_to_all_waiters() {
    let coalescer: QueryCoalescer<i64> = QueryCoalescer::new();
    let barrier = Barrier::new(4);

    thread::scope(|scope| {
        for _ in 0..4 {
            let coalescer = &coalescer;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                let result = coalescer.try_coalesce("testdb.testcoll", 5, || {
                    thread::sleep(Duration::from_millis(30));
                    Err(DocshardError::NotFound("config.chunks".into()))
                });
                match result {
                    Err(DocshardError::NotFound(message)) => {
                        assert_eq!(message, "config.chunks");
                    }
                    Err(other) => panic!("unexpected error {other:?}"),
                    Ok(_) => panic!("query failure must propagate"),
                }
            });
        }
    });

    let stats = coalescer.get_stats();
    assert_eq!(
        stats.total_requests,
        stats.actual_queries + stats.coalesced_requests + stats.timeout_requests
    );
}

/// Groups are namespace-scoped: traffic on one namespace never blocks or
/// merges with another.
#[test]
fn namespaces_coalesce_independently() {
    let coalescer: QueryCoalescer<i64> = QueryCoalescer::new();
    let executions = AtomicUsize::new(0);
    let barrier = Barrier::new(6);

    thread::scope(|scope| {
        for i in 0..6usize {
            let coalescer = &coalescer;
            let executions = &executions;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                let ns = if i % 2 == 0 { "db.even" } else { "db.odd" };
                let result = coalescer
                    .try_coalesce(ns, 100, || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(vec![i as i64 % 2])
                    })
                    .expect("query");
                assert_eq!(result[0], i as i64 % 2);
            });
        }
    });

    let count = executions.load(Ordering::SeqCst);
    assert!((2..=6).contains(&count));
}
