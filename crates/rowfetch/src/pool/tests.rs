use crate::{
    PoolConfig, ResultSink, SinkReader, WorkerPool, lookup_fn,
    pool::dispatcher::Dispatcher,
};
use rowfetch_core::{Error, Key, LookupError, LookupFn, LookupResult, PoolFault};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, mpsc as std_mpsc},
    time::Duration,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn key(name: &str) -> Key {
    Key::copy_from_slice(name.as_bytes())
}

fn echo() -> LookupFn<String> {
    lookup_fn(|key: &Key| Ok(String::from_utf8_lossy(key).into_owned()))
}

fn config(num_workers: usize, queue_capacity: usize, sink_channel_capacity: usize) -> PoolConfig {
    PoolConfig {
        num_workers,
        queue_capacity,
        sink_channel_capacity,
        sink_backlog_capacity: 4,
    }
}

async fn submit_all(
    dispatcher: &Dispatcher<String>,
    lookup: &LookupFn<String>,
    sink: &Arc<ResultSink<String>>,
    names: &[&str],
) {
    for (i, name) in names.iter().enumerate() {
        dispatcher
            .enqueue(key(name), Arc::clone(lookup), sink, i + 1 == names.len())
            .await
            .unwrap();
    }
}

/// Reads to end-of-stream, with an upper bound so a hang fails the test.
async fn read_all(reader: &mut SinkReader<String>) -> Vec<LookupResult<String>> {
    let cancel = CancellationToken::new();
    let mut results = Vec::new();
    loop {
        let next = timeout(Duration::from_secs(10), reader.read(&cancel))
            .await
            .expect("read should not hang")
            .unwrap();
        match next {
            Some(result) => results.push(result),
            None => return results,
        }
    }
}

fn sorted_rows(results: Vec<LookupResult<String>>) -> Vec<String> {
    let mut rows: Vec<String> = results.into_iter().map(Result::unwrap).collect();
    rows.sort();
    rows
}

#[tokio::test]
async fn five_keys_through_two_workers_and_a_small_sink() {
    let pool = WorkerPool::new(config(2, 8, 2)).unwrap();
    let dispatcher = pool.dispatcher();
    let (sink, mut reader) = dispatcher.sink();
    let lookup = echo();

    submit_all(&dispatcher, &lookup, &sink, &["k1", "k2", "k3", "k4", "k5"]).await;

    let cancel = CancellationToken::new();
    let mut rows = Vec::new();
    for _ in 0..5 {
        let result = timeout(Duration::from_secs(10), reader.read(&cancel))
            .await
            .unwrap()
            .unwrap()
            .expect("five results before end-of-stream");
        rows.push(result.unwrap());
    }
    rows.sort();
    assert_eq!(rows, ["k1", "k2", "k3", "k4", "k5"]);

    assert!(reader.read(&cancel).await.unwrap().is_none());
    let stats = sink.stats();
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.completed_writes, 5);
}

#[tokio::test]
async fn zero_keys_sealed_is_end_of_stream() {
    let pool = WorkerPool::<String>::new(config(2, 8, 2)).unwrap();
    let (sink, mut reader) = pool.dispatcher().sink();
    sink.seal().unwrap();

    assert!(read_all(&mut reader).await.is_empty());
}

#[tokio::test]
async fn results_match_lookups_regardless_of_path_taken() {
    let pool = WorkerPool::new(config(4, 16, 1)).unwrap();
    let dispatcher = pool.dispatcher();
    let (sink, mut reader) = dispatcher.sink();
    let lookup = lookup_fn(|key: &Key| Ok(format!("row-{}", String::from_utf8_lossy(key))));

    let names: Vec<String> = (0..200).map(|i| format!("k{i}")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    submit_all(&dispatcher, &lookup, &sink, &name_refs).await;

    // Slow consumer: most results end up in the backlog.
    let cancel = CancellationToken::new();
    let mut results = Vec::new();
    while let Some(result) = reader.read(&cancel).await.unwrap() {
        results.push(result);
        if results.len() % 50 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let mut expected: Vec<String> = names.iter().map(|n| format!("row-{n}")).collect();
    expected.sort();
    assert_eq!(sorted_rows(results), expected);
}

#[tokio::test]
async fn panicking_lookup_is_isolated_to_its_key() {
    // A single worker proves the same worker keeps going after the panic.
    let pool = WorkerPool::new(config(1, 8, 8)).unwrap();
    let dispatcher = pool.dispatcher();
    let lookup = lookup_fn(|key: &Key| {
        if &key[..] == b"k3" {
            panic!("corrupt index entry");
        }
        Ok(String::from_utf8_lossy(key).into_owned())
    });

    let (sink, mut reader) = dispatcher.sink();
    submit_all(&dispatcher, &lookup, &sink, &["k1", "k2", "k3", "k4", "k5"]).await;
    let results = read_all(&mut reader).await;
    assert_eq!(results.len(), 5);

    let (failed, ok): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_err);
    assert_eq!(failed.len(), 1);
    match &failed[0] {
        Err(LookupError::Panicked { message }) => assert_eq!(message, "corrupt index entry"),
        other => panic!("expected a contained panic, got {other:?}"),
    }
    assert_eq!(sorted_rows(ok), ["k1", "k2", "k4", "k5"]);

    // Another scan on the same pool is unaffected.
    let (sink, mut reader) = dispatcher.sink();
    submit_all(&dispatcher, &lookup, &sink, &["k6", "k7"]).await;
    assert_eq!(sorted_rows(read_all(&mut reader).await), ["k6", "k7"]);
}

#[tokio::test]
async fn lookup_errors_are_returned_per_key() {
    let pool = WorkerPool::new(config(2, 8, 8)).unwrap();
    let dispatcher = pool.dispatcher();
    let lookup = lookup_fn(|key: &Key| match &key[..] {
        b"missing" => Err(LookupError::failed("no row for key")),
        other => Ok(String::from_utf8_lossy(other).into_owned()),
    });

    let (sink, mut reader) = dispatcher.sink();
    submit_all(&dispatcher, &lookup, &sink, &["a", "missing", "b"]).await;
    let results = read_all(&mut reader).await;

    let errors: Vec<String> = results
        .iter()
        .filter_map(|r| r.as_ref().err().map(ToString::to_string))
        .collect();
    assert_eq!(errors, ["Lookup failed: no row for key"]);
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn cancelled_read_returns_immediately_with_results_pending() {
    let pool = WorkerPool::new(config(2, 8, 1)).unwrap();
    let dispatcher = pool.dispatcher();
    let (sink, mut reader) = dispatcher.sink();
    submit_all(&dispatcher, &echo(), &sink, &["a", "b", "c", "d"]).await;

    // Let the workers finish so results sit in the channel and backlog.
    timeout(Duration::from_secs(10), async {
        while !sink.is_complete() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert!(sink.stats().backlog_len > 0);

    let cancel = CancellationToken::new();
    assert!(reader.read(&cancel).await.unwrap().is_some());
    cancel.cancel();
    assert_eq!(reader.read(&cancel).await.unwrap_err(), Error::Cancelled);
}

#[tokio::test]
async fn unfinished_submission_keeps_reader_waiting() {
    let pool = WorkerPool::new(config(2, 8, 4)).unwrap();
    let dispatcher = pool.dispatcher();
    let (sink, mut reader) = dispatcher.sink();
    dispatcher
        .enqueue(key("only"), echo(), &sink, false)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let first = timeout(Duration::from_secs(10), reader.read(&cancel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.unwrap().unwrap(), "only");

    // Every submitted key is done but the scan never said it was finished.
    let waiting = timeout(Duration::from_millis(50), reader.read(&cancel)).await;
    assert!(waiting.is_err());

    sink.seal().unwrap();
    assert!(reader.read(&cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_scans_only_see_their_own_keys() {
    let pool = Arc::new(WorkerPool::new(config(4, 32, 4)).unwrap());
    let lookup = echo();

    let scans = (0..8).map(|scan_id| {
        let dispatcher = pool.dispatcher();
        let lookup = Arc::clone(&lookup);
        tokio::spawn(async move {
            let names: Vec<String> = (0..50).map(|i| format!("s{scan_id}-k{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let (sink, mut reader) = dispatcher.sink();
            submit_all(&dispatcher, &lookup, &sink, &refs).await;
            (names, sorted_rows(read_all(&mut reader).await))
        })
    });

    for handle in futures::future::join_all(scans).await {
        let (mut names, rows) = handle.unwrap();
        names.sort();
        assert_eq!(rows, names);
    }
}

#[tokio::test]
async fn full_queue_is_the_only_submission_wait() {
    let pool = WorkerPool::new(config(1, 1, 8)).unwrap();
    let dispatcher = pool.dispatcher();

    // Each lookup waits for one release token.
    let (release, gate) = std_mpsc::channel::<()>();
    let gate = Arc::new(Mutex::new(gate));
    let lookup = lookup_fn(move |key: &Key| {
        let _ = gate.lock().unwrap().recv();
        Ok(String::from_utf8_lossy(key).into_owned())
    });

    let (sink, mut reader) = dispatcher.sink();
    // k1 goes to the worker, which then blocks; k2 fills the queue.
    for name in ["k1", "k2"] {
        timeout(
            Duration::from_secs(10),
            dispatcher.enqueue(key(name), Arc::clone(&lookup), &sink, false),
        )
        .await
        .unwrap()
        .unwrap();
    }

    let blocked = timeout(
        Duration::from_millis(100),
        dispatcher.enqueue(key("k3"), Arc::clone(&lookup), &sink, false),
    )
    .await;
    assert!(blocked.is_err(), "enqueue must wait while the queue is full");

    // The abandoned submission was still accounted for.
    release.send(()).unwrap();
    release.send(()).unwrap();
    sink.seal().unwrap();

    let results = read_all(&mut reader).await;
    assert_eq!(results.len(), 3);
    let aborted = results
        .iter()
        .filter(|r| matches!(r, Err(LookupError::Aborted { .. })))
        .count();
    assert_eq!(aborted, 1);
}

#[tokio::test]
async fn final_submission_cannot_be_followed() {
    let pool = WorkerPool::new(config(1, 4, 4)).unwrap();
    let dispatcher = pool.dispatcher();
    let (sink, mut reader) = dispatcher.sink();
    let lookup = echo();

    submit_all(&dispatcher, &lookup, &sink, &["a"]).await;
    let err = dispatcher
        .enqueue(key("b"), lookup, &sink, true)
        .await
        .unwrap_err();
    assert_eq!(err, Error::SubmissionSealed);

    assert_eq!(sorted_rows(read_all(&mut reader).await), ["a"]);
}

#[tokio::test]
async fn shutdown_drains_queued_work_then_refuses() {
    let pool = WorkerPool::new(config(1, 16, 16)).unwrap();
    let dispatcher = pool.dispatcher();
    let lookup = lookup_fn(|key: &Key| {
        std::thread::sleep(Duration::from_millis(5));
        Ok(String::from_utf8_lossy(key).into_owned())
    });

    let (sink, mut reader) = dispatcher.sink();
    submit_all(&dispatcher, &lookup, &sink, &["a", "b", "c", "d", "e"]).await;
    pool.shutdown(Duration::from_secs(10)).await.unwrap();
    assert!(pool.is_shutdown());

    assert_eq!(
        sorted_rows(read_all(&mut reader).await),
        ["a", "b", "c", "d", "e"]
    );

    let (sink, mut reader) = dispatcher.sink();
    let err = dispatcher
        .enqueue(key("late"), lookup, &sink, true)
        .await
        .unwrap_err();
    assert_eq!(err, Error::PoolShutdown);

    let results = read_all(&mut reader).await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(LookupError::PoolShutdown)));

    // A second shutdown is a no-op.
    pool.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn closed_queue_is_published_as_a_fault() {
    let pool = WorkerPool::<String>::new(config(2, 4, 4)).unwrap();
    let mut faults = pool.faults();
    assert!(faults.borrow().is_none());

    // Dropping every submission handle without shutting down closes the
    // queue under running workers.
    drop(pool);

    let fault = timeout(Duration::from_secs(10), faults.wait_for(Option::is_some))
        .await
        .expect("a worker should report the closed queue")
        .map(|fault| *fault)
        .unwrap();
    assert!(matches!(fault, Some(PoolFault::QueueClosed { .. })));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let err = WorkerPool::<String>::new(config(0, 4, 4)).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));

    let err = WorkerPool::<String>::new(config(2, 0, 4)).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

#[test]
fn pool_requires_a_runtime() {
    let err = WorkerPool::<String>::new(config(1, 4, 4)).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { reason } if reason.contains("tokio runtime")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cardinality_holds_under_parallel_load() {
    let pool = WorkerPool::new(config(8, 64, 2)).unwrap();
    let dispatcher = pool.dispatcher();
    let lookup = lookup_fn(|key: &Key| Ok(String::from_utf8_lossy(key).into_owned()));

    let names: Vec<String> = (0..1000).map(|i| format!("k{}", i % 250)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (sink, mut reader) = dispatcher.sink();
    submit_all(&dispatcher, &lookup, &sink, &refs).await;

    // Duplicate keys: compare as a multiset.
    let mut counts: HashMap<String, usize> = HashMap::new();
    for row in sorted_rows(read_all(&mut reader).await) {
        *counts.entry(row).or_default() += 1;
    }
    assert_eq!(counts.len(), 250);
    assert!(counts.values().all(|&n| n == 4));
}
