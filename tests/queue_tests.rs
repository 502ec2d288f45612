//! Tests for the work queue: FIFO ordering and sentinel-based shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;

use fabric_supervisor::exec::queue::WasmWorker;
use fabric_supervisor::model::request::RequestEntry;

fn entry(function_name: &str) -> RequestEntry {
    RequestEntry::new(
        "queue-test".into(),
        "m".into(),
        function_name.into(),
        "POST".into(),
        IndexMap::new(),
        HashMap::new(),
    )
}

#[test]
fn worker_processes_entries_in_fifo_order() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let sink = processed.clone();
    let worker = WasmWorker::spawn(move |entry| {
        sink.lock().push(entry.function_name);
    });

    let queue = worker.queue();
    assert!(queue.submit(entry("first")));
    assert!(queue.submit(entry("second")));
    assert!(queue.submit(entry("third")));

    worker.shutdown();
    assert_eq!(&*processed.lock(), &["first", "second", "third"]);
}

#[test]
fn shutdown_drains_only_up_to_the_sentinel() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let sink = processed.clone();
    let worker = WasmWorker::spawn(move |entry| {
        // Slow consumer, so submissions below land in the queue first.
        std::thread::sleep(Duration::from_millis(20));
        sink.lock().push(entry.function_name);
    });

    let queue = worker.queue();
    assert!(queue.submit(entry("before")));
    worker.shutdown();

    // The worker is gone; entries sent past the sentinel are never run.
    queue.submit(entry("after"));
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(&*processed.lock(), &["before"]);
}

#[test]
fn single_consumer_sees_every_producer() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let sink = processed.clone();
    let worker = WasmWorker::spawn(move |entry| {
        sink.lock().push(entry.function_name);
    });

    let mut producers = Vec::new();
    for i in 0..4 {
        let queue = worker.queue();
        producers.push(std::thread::spawn(move || {
            for j in 0..8 {
                assert!(queue.submit(entry(&format!("p{}-{}", i, j))));
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    worker.shutdown();
    assert_eq!(processed.lock().len(), 32);
}
