//! Round-trip test for the persistence daemon against an in-memory store:
//! load, mutate, write-behind save, reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use triton::db::{
    Connection, Connector, DbConfig, DbError, DbResult, DbValue, PersistenceDaemon, Persistable,
    Row, SaveContext,
};
use triton::jobs::JobPool;

/// An in-memory key/value table speaking a two-verb statement language:
/// `SET <key> <value>` and `GET <key>`.
struct MemoryStore {
    rows: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, key: &str, value: i64) {
        self.rows.lock().unwrap().insert(key.to_owned(), value);
    }
}

struct MemoryConnector(Arc<MemoryStore>);

impl Connector for MemoryConnector {
    fn connect(&self, _config: &DbConfig) -> DbResult<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection(Arc::clone(&self.0))))
    }
}

struct MemoryConnection(Arc<MemoryStore>);

impl Connection for MemoryConnection {
    fn execute(&mut self, stmt: &str) -> DbResult<u64> {
        let mut parts = stmt.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                let value = value
                    .parse::<i64>()
                    .map_err(|e| DbError::Data(e.to_string()))?;
                self.0.rows.lock().unwrap().insert(key.to_owned(), value);
                Ok(1)
            }
            _ => Err(DbError::Data(format!("unsupported statement `{stmt}`"))),
        }
    }

    fn query(&mut self, stmt: &str) -> DbResult<Vec<Row>> {
        match stmt.split_once(' ') {
            Some(("GET", key)) => Ok(self
                .0
                .rows
                .lock()
                .unwrap()
                .get(key)
                .map(|&value| Row::new(vec![("value".to_owned(), DbValue::Int(value))]))
                .into_iter()
                .collect()),
            _ => Err(DbError::Data(format!("unsupported statement `{stmt}`"))),
        }
    }
}

/// A persisted player score, keyed by player id.
struct Score {
    context: SaveContext,
    key: String,
    value: AtomicI64,
}

impl Score {
    fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            context: SaveContext::new(),
            key: key.to_owned(),
            value: AtomicI64::new(0),
        })
    }
}

impl Persistable for Score {
    fn save_context(&self) -> &SaveContext {
        &self.context
    }

    fn sync_save(&self, conn: &mut dyn Connection) -> DbResult<()> {
        let value = self.value.load(Ordering::SeqCst);
        conn.execute(&format!("SET {} {}", self.key, value))?;
        Ok(())
    }

    fn sync_load(&self, conn: &mut dyn Connection, filter: &str) -> DbResult<()> {
        let rows = conn.query(&format!("GET {filter}"))?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::Data(format!("no row matches `{filter}`")))?;
        let value = row
            .get("value")
            .and_then(DbValue::as_i64)
            .ok_or_else(|| DbError::Data("missing value column".to_owned()))?;
        self.value.store(value, Ordering::SeqCst);
        Ok(())
    }
}

fn load_and_wait(daemon: &PersistenceDaemon, score: &Arc<Score>, filter: &str) {
    let (tx, rx) = std::sync::mpsc::channel();
    daemon.pend_for_loading(
        Arc::clone(score) as Arc<dyn Persistable>,
        filter.to_owned(),
        Some(Box::new(move |_object| {
            let _ = tx.send(());
        })),
    );
    rx.recv_timeout(Duration::from_secs(10))
        .expect("load completion callback");
}

#[test]
fn load_mutate_save_reload_round_trip() {
    triton::log::init();

    let store = MemoryStore::new();
    store.insert("player:1", 7);

    let jobs = JobPool::start(2);
    let daemon = PersistenceDaemon::new(
        DbConfig::default().with_save_delay(Duration::from_millis(30)),
        Box::new(MemoryConnector(Arc::clone(&store))),
        Arc::clone(&jobs),
    );
    daemon.start();

    // Load populates the object and arms auto-saving.
    let score = Score::new("player:1");
    load_and_wait(&daemon, &score, "player:1");
    assert_eq!(score.value.load(Ordering::SeqCst), 7);
    assert!(score.save_context().is_auto_saving());

    // Mutate and schedule a write-behind save.
    score.value.store(9, Ordering::SeqCst);
    daemon.pend_for_saving(Arc::clone(&score) as Arc<dyn Persistable>);
    daemon.wait_for_all_async_operations();

    // A fresh object loaded with the same filter observes the mutation.
    let fresh = Score::new("player:1");
    load_and_wait(&daemon, &fresh, "player:1");
    assert_eq!(fresh.value.load(Ordering::SeqCst), 9);

    daemon.stop();
    jobs.stop();
}

#[test]
fn failed_load_does_not_invoke_the_callback() {
    triton::log::init();

    let store = MemoryStore::new();
    let jobs = JobPool::start(1);
    let daemon = PersistenceDaemon::new(
        DbConfig::default().with_save_delay(Duration::from_millis(30)),
        Box::new(MemoryConnector(Arc::clone(&store))),
        Arc::clone(&jobs),
    );
    daemon.start();

    let score = Score::new("player:404");
    let (tx, rx) = std::sync::mpsc::channel();
    daemon.pend_for_loading(
        Arc::clone(&score) as Arc<dyn Persistable>,
        "player:404".to_owned(),
        Some(Box::new(move |_object| {
            let _ = tx.send(());
        })),
    );

    daemon.wait_for_all_async_operations();
    daemon.stop();
    jobs.stop();

    assert!(
        rx.try_recv().is_err(),
        "a failed load must not deliver its completion"
    );
    assert!(!score.save_context().is_auto_saving());
}
