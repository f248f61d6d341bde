use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sqlite_broker::prelude::*;
use sqlite_broker::test_utils::StubEngine;

async fn open_stub(name: &str) -> (Arc<StubEngine>, Database) {
    let engine = Arc::new(StubEngine::new());
    let broker = SqliteBroker::new(engine.clone());
    let db = broker.open_database(OpenArgs::new(name)).await.unwrap();
    (engine, db)
}

#[tokio::test]
async fn bare_execute_sql_skips_transaction_control() {
    let (engine, db) = open_stub("bare.db").await;
    db.execute_sql("SELECT 1", vec![]).await.unwrap();
    assert_eq!(engine.dispatched_sql(), vec!["SELECT 1"]);
}

#[tokio::test]
async fn statements_batch_per_round_with_begin_first() {
    let (engine, db) = open_stub("rounds.db").await;
    db.transaction(|tx| {
        tx.execute_sql("INSERT INTO t VALUES (1)", vec![])?;
        tx.execute_sql("INSERT INTO t VALUES (2)", vec![])
    })
    .await
    .unwrap();

    assert_eq!(
        engine.batches(),
        vec![
            vec!["BEGIN".to_owned()],
            vec![
                "INSERT INTO t VALUES (1)".to_owned(),
                "INSERT INTO t VALUES (2)".to_owned(),
            ],
            vec!["COMMIT".to_owned()],
        ]
    );
}

#[tokio::test]
async fn partial_failure_fires_all_continuations_and_rolls_back() {
    let (engine, db) = open_stub("partial.db").await;
    engine.fail_sql_containing("boom");

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let (e1, e2, e3) = (events.clone(), events.clone(), events.clone());
    let result = db
        .transaction(move |tx| {
            tx.execute_sql_with(
                "SELECT 1",
                vec![],
                Some(Box::new(move |_, _| {
                    e1.lock().unwrap().push("ok1");
                    Ok(())
                })),
                None,
            )?;
            tx.execute_sql_with(
                "SELECT boom",
                vec![],
                None,
                Some(Box::new(move |_, failure| {
                    assert!(failure.to_string().contains("forced failure"));
                    e2.lock().unwrap().push("fail2");
                    Err(SqlBrokerError::Execution("statement 2 failed".into()))
                })),
            )?;
            tx.execute_sql_with(
                "SELECT 3",
                vec![],
                Some(Box::new(move |_, _| {
                    e3.lock().unwrap().push("ok3");
                    Ok(())
                })),
                None,
            )
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "execution error: statement 2 failed");
    // Every statement in the round still reached its continuation.
    assert_eq!(*events.lock().unwrap(), vec!["ok1", "fail2", "ok3"]);

    let dispatched = engine.dispatched_sql();
    assert_eq!(dispatched.last().map(String::as_str), Some("ROLLBACK"));
    assert!(!dispatched.iter().any(|sql| sql == "COMMIT"));
}

#[tokio::test]
async fn unhandled_statement_failure_reports_the_source() {
    let (engine, db) = open_stub("unhandled.db").await;
    engine.fail_sql_containing("boom");

    let err = db
        .transaction(|tx| tx.execute_sql("SELECT boom", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlBrokerError::UnhandledStatement(_)));
    assert!(err.to_string().contains("no error handler"));
    assert_eq!(err.code(), 1);
}

#[tokio::test]
async fn acknowledged_failure_lets_the_transaction_commit() {
    let (engine, db) = open_stub("ack.db").await;
    engine.fail_sql_containing("boom");

    db.transaction(|tx| {
        tx.execute_sql_with(
            "SELECT boom",
            vec![],
            None,
            Some(Box::new(|_, _| Ok(()))),
        )?;
        tx.execute_sql("SELECT 2", vec![])
    })
    .await
    .unwrap();

    assert!(engine.dispatched_sql().iter().any(|sql| sql == "COMMIT"));
}

#[tokio::test]
async fn begin_failure_skips_the_body() {
    let (engine, db) = open_stub("begin.db").await;
    engine.fail_sql_containing("BEGIN");

    let body_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&body_ran);
    let err = db
        .transaction(move |tx| {
            flag.store(true, Ordering::SeqCst);
            tx.execute_sql("INSERT INTO t VALUES (1)", vec![])
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SqlBrokerError::BeginFailed(_)));
    assert!(!body_ran.load(Ordering::SeqCst));
    assert_eq!(engine.batches(), vec![vec!["BEGIN".to_owned()]]);
}

#[tokio::test]
async fn body_error_aborts_without_dispatching_queued_statements() {
    let (engine, db) = open_stub("body.db").await;

    let err = db
        .transaction(|tx| {
            tx.execute_sql("INSERT INTO t VALUES (1)", vec![])?;
            Err(SqlBrokerError::Execution("body bailed".into()))
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "execution error: body bailed");
    assert_eq!(
        engine.batches(),
        vec![vec!["BEGIN".to_owned()], vec!["ROLLBACK".to_owned()]]
    );
}

#[tokio::test]
async fn commit_failure_surfaces() {
    let (engine, db) = open_stub("commit.db").await;
    engine.fail_sql_containing("COMMIT");

    let err = db
        .transaction(|tx| tx.execute_sql("SELECT 1", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlBrokerError::CommitFailed(_)));
}

#[tokio::test]
async fn rollback_failure_carries_both_errors() {
    let (engine, db) = open_stub("rollback.db").await;
    engine.fail_sql_containing("boom");
    engine.fail_sql_containing("ROLLBACK");

    let err = db
        .transaction(|tx| tx.execute_sql("SELECT boom", vec![]))
        .await
        .unwrap_err();
    let SqlBrokerError::RollbackFailed { original, rollback } = err else {
        panic!("expected RollbackFailed, got {err}");
    };
    assert!(matches!(*original, SqlBrokerError::UnhandledStatement(_)));
    assert!(rollback.to_string().contains("ROLLBACK"));
}

#[tokio::test]
async fn success_continuation_enqueues_the_next_round() {
    let (engine, db) = open_stub("chain.db").await;

    let second_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&second_ran);
    db.transaction(move |tx| {
        tx.execute_sql_with(
            "SELECT first",
            vec![],
            Some(Box::new(move |tx, _| {
                tx.execute_sql_with(
                    "SELECT second",
                    vec![],
                    Some(Box::new(move |_, _| {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    })),
                    None,
                )
            })),
            None,
        )
    })
    .await
    .unwrap();

    assert!(second_ran.load(Ordering::SeqCst));
    assert_eq!(
        engine.batches(),
        vec![
            vec!["BEGIN".to_owned()],
            vec!["SELECT first".to_owned()],
            vec!["SELECT second".to_owned()],
            vec!["COMMIT".to_owned()],
        ]
    );
}

#[tokio::test]
async fn canned_rows_reach_the_continuation() {
    let (engine, db) = open_stub("rows.db").await;
    engine.respond_with_rows(
        "SELECT name FROM users",
        vec!["name"],
        vec![
            vec![SqlValue::Text("alice".into())],
            vec![SqlValue::Text("bob".into())],
        ],
    );

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    db.read_transaction(move |tx| {
        tx.execute_sql_with(
            "SELECT name FROM users",
            vec![],
            Some(Box::new(move |_, result| {
                for row in result.rows() {
                    let name = row.get("name").and_then(SqlValue::as_text).unwrap();
                    sink.lock().unwrap().push(name.to_owned());
                }
                Ok(())
            })),
            None,
        )
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["alice", "bob"]);

    // The bare path surfaces the same rows directly.
    let result = db.execute_sql("SELECT name FROM users", vec![]).await.unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(
        result.item(1).unwrap().get_index(0).and_then(|v| v.as_text()),
        Some("bob")
    );
}

#[tokio::test]
async fn read_only_transaction_rejects_mutations_end_to_end() {
    let (engine, db) = open_stub("readonly.db").await;

    let err = db
        .read_transaction(|tx| tx.execute_sql("INSERT INTO t VALUES (1)", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlBrokerError::ReadOnlyViolation(_)));

    // The rejection happens before dispatch; only the control rounds went out.
    assert_eq!(
        engine.batches(),
        vec![vec!["BEGIN".to_owned()], vec!["ROLLBACK".to_owned()]]
    );
}

#[tokio::test]
async fn first_failure_wins_within_a_round() {
    let (_engine, db) = open_stub("firstwins.db").await;

    let err = db
        .transaction(|tx| {
            tx.execute_sql_with(
                "SELECT 1",
                vec![],
                Some(Box::new(|_, _| {
                    Err(SqlBrokerError::Execution("first".into()))
                })),
                None,
            )?;
            tx.execute_sql_with(
                "SELECT 2",
                vec![],
                Some(Box::new(|_, _| {
                    Err(SqlBrokerError::Execution("second".into()))
                })),
                None,
            )
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "execution error: first");
}

#[tokio::test]
async fn unsupported_param_fails_before_dispatch() {
    let (engine, db) = open_stub("params.db").await;

    let err = db
        .execute_sql(
            "INSERT INTO t VALUES (?)",
            vec![SqlParam::Unsupported("closure".into())],
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported parameter type <closure>"));
    assert!(engine.dispatched_sql().is_empty());
}
