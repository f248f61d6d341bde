use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlite_broker::prelude::*;
use sqlite_broker::test_utils::StubEngine;

fn stub_broker() -> (Arc<StubEngine>, SqliteBroker) {
    let engine = Arc::new(StubEngine::new());
    let broker = SqliteBroker::new(engine.clone());
    (engine, broker)
}

#[tokio::test]
async fn transactions_run_in_fifo_order_without_overlap() {
    let (engine, broker) = stub_broker();
    engine.set_batch_delay(Duration::from_millis(20));
    let db = broker
        .open_database(OpenArgs::new("queue.db"))
        .await
        .unwrap();

    let order: Arc<Mutex<Vec<usize>>> = Arc::default();
    let mut handles = Vec::new();
    for i in 0..5 {
        let db = db.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            db.transaction(move |tx| {
                order.lock().unwrap().push(i);
                tx.execute_sql("SELECT 1", vec![])
            })
            .await
        }));
        // Small gap so the enqueue order is deterministic; the batch delay is
        // long enough that transactions would overlap without the lock.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(
        engine.max_concurrent_batches(),
        1,
        "a single database must never have two batches in flight"
    );
}

#[tokio::test]
async fn bare_statements_share_the_same_queue() {
    let (engine, broker) = stub_broker();
    engine.set_batch_delay(Duration::from_millis(20));
    let db = broker
        .open_database(OpenArgs::new("queue.db"))
        .await
        .unwrap();

    let slow = {
        let db = db.clone();
        tokio::spawn(async move {
            db.transaction(|tx| tx.execute_sql("SELECT slow", vec![]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    db.execute_sql("SELECT fast", vec![]).await.unwrap();
    slow.await.unwrap().unwrap();

    // The bare statement was admitted after the in-flight transaction
    // finished, so its dispatch comes last.
    let dispatched = engine.dispatched_sql();
    let slow_pos = dispatched.iter().position(|s| s == "SELECT slow").unwrap();
    let fast_pos = dispatched.iter().position(|s| s == "SELECT fast").unwrap();
    assert!(slow_pos < fast_pos);
    assert_eq!(engine.max_concurrent_batches(), 1);
}

#[tokio::test]
async fn different_databases_run_concurrently() {
    let (engine, broker) = stub_broker();
    engine.set_batch_delay(Duration::from_millis(50));
    let db_a = broker.open_database(OpenArgs::new("a.db")).await.unwrap();
    let db_b = broker.open_database(OpenArgs::new("b.db")).await.unwrap();

    let t_a = tokio::spawn(async move {
        db_a.transaction(|tx| tx.execute_sql("SELECT 'a'", vec![]))
            .await
    });
    let t_b = tokio::spawn(async move {
        db_b.transaction(|tx| tx.execute_sql("SELECT 'b'", vec![]))
            .await
    });
    t_a.await.unwrap().unwrap();
    t_b.await.unwrap().unwrap();

    assert!(
        engine.max_concurrent_batches() >= 2,
        "independent databases should have batches in flight concurrently"
    );
}
