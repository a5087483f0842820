//! The persistence daemon worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use triton_jobs::JobPool;

use crate::config::DbConfig;
use crate::connection::{Connection, Connector};
use crate::object::Persistable;

/// Completion callback for a pended load, delivered on the job pool with the
/// freshly populated object.
pub type LoadCallback = Box<dyn FnOnce(Arc<dyn Persistable>) + Send + 'static>;

struct SaveItem {
    object: Arc<dyn Persistable>,
    /// Stamp taken from the object's [`crate::SaveContext`] at pend time.
    /// Stale stamps mark tombstones.
    sequence: u64,
    deadline: Instant,
}

struct LoadItem {
    object: Arc<dyn Persistable>,
    filter: String,
    callback: Option<LoadCallback>,
}

enum Work {
    Save(SaveItem),
    Load(LoadItem),
}

#[derive(Default)]
struct Queues {
    saves: VecDeque<SaveItem>,
    loads: VecDeque<LoadItem>,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.loads.is_empty()
    }
}

struct DaemonInner {
    running: AtomicBool,
    queues: Mutex<Queues>,
    work_avail: Condvar,
    queues_empty: Condvar,
    config: DbConfig,
    connector: Box<dyn Connector>,
    jobs: Arc<JobPool>,
}

/// The asynchronous persistence daemon.
///
/// One worker thread owns the database connection. Producers pend save and
/// load intents from any thread; saves for the same object coalesce within
/// the configured delay window, loads run FIFO and deliver their completion
/// callbacks through the job pool. Database failures discard the connection
/// and re-enter a backoff connect loop; they are never reported to producers.
pub struct PersistenceDaemon {
    inner: Arc<DaemonInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceDaemon {
    pub fn new(config: DbConfig, connector: Box<dyn Connector>, jobs: Arc<JobPool>) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                running: AtomicBool::new(false),
                queues: Mutex::new(Queues::default()),
                work_avail: Condvar::new(),
                queues_empty: Condvar::new(),
                config,
                connector,
                jobs,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Launches the worker. Starting an already-running daemon is an
    /// invariant violation and terminates the process.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            triton_log::fatal!("Only one persistence worker is allowed at a time.");
            std::process::abort();
        }
        triton_log::info!("Starting persistence daemon...");

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("triton-db".to_owned())
            .spawn(move || worker_proc(&inner))
            .expect("failed to spawn persistence worker");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Cooperative quit: clears the run flag, wakes the worker, joins it.
    /// Queued work is drained first; if the server is unreachable the worker
    /// abandons the backoff instead.
    pub fn stop(&self) {
        triton_log::info!("Stopping persistence daemon...");

        self.inner.running.store(false, Ordering::SeqCst);
        {
            let _queues = self.inner.queues.lock().unwrap();
            self.inner.work_avail.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Blocks until both queues are empty at the observation instant.
    ///
    /// This is the weaker contract: a save pended after this returns, or one
    /// already handed to the worker, may still be in flight. It promises
    /// queue emptiness, not durability.
    pub fn wait_for_all_async_operations(&self) {
        let mut queues = self.inner.queues.lock().unwrap();
        while !queues.is_empty() {
            queues = self.inner.queues_empty.wait(queues).unwrap();
        }
    }

    /// Schedules `object` for a write-behind save after the configured delay.
    /// Pending the same object again within the window supersedes this
    /// intent.
    pub fn pend_for_saving(&self, object: Arc<dyn Persistable>) {
        let sequence = object.save_context().advance();
        let deadline = Instant::now() + self.inner.config.save_delay;

        let mut queues = self.inner.queues.lock().unwrap();
        queues.saves.push_back(SaveItem {
            object,
            sequence,
            deadline,
        });
        drop(queues);
        self.inner.work_avail.notify_all();
    }

    /// Schedules `object` to be populated from rows matching `filter`. On
    /// success the object's auto-save mode is enabled and `callback` is
    /// pended as a job; on failure the callback is not invoked.
    pub fn pend_for_loading(
        &self,
        object: Arc<dyn Persistable>,
        filter: String,
        callback: Option<LoadCallback>,
    ) {
        let mut queues = self.inner.queues.lock().unwrap();
        queues.loads.push_back(LoadItem {
            object,
            filter,
            callback,
        });
        drop(queues);
        self.inner.work_avail.notify_all();
    }
}

fn worker_proc(inner: &DaemonInner) {
    triton_log::set_thread_tag("db");
    triton_log::info!("Persistence daemon started.");
    triton_log::debug!("Database server = {}", inner.config.server);
    triton_log::debug!("Database username = {}", inner.config.username);
    triton_log::debug!("Database schema = {}", inner.config.schema);
    triton_log::debug!("Database save delay = {:?}", inner.config.save_delay);
    triton_log::debug!(
        "Database max reconnect delay = {:?}",
        inner.config.max_reconn_delay
    );

    'reconnect: loop {
        // Stopped while the server was unreachable; whatever is still queued
        // cannot be serviced.
        let Some(mut conn) = connect_with_backoff(inner) else {
            break;
        };

        loop {
            let Some(work) = next_work(inner) else {
                break 'reconnect;
            };

            match work {
                Work::Save(item) => {
                    if let Err(e) = item.object.sync_save(conn.as_mut()) {
                        triton_log::error!("Error saving object: {e}");
                        if e.discards_connection() {
                            triton_log::info!(
                                "The connection was left in an indeterminate state, discarding it."
                            );
                            continue 'reconnect;
                        }
                    }
                }
                Work::Load(item) => match item.object.sync_load(conn.as_mut(), &item.filter) {
                    Ok(()) => {
                        item.object.save_context().enable_auto_saving();
                        if let Some(callback) = item.callback {
                            let object = item.object;
                            inner.jobs.pend(Box::new(move || callback(object)));
                        }
                    }
                    Err(e) => {
                        triton_log::error!("Error loading object: {e}");
                        if e.discards_connection() {
                            triton_log::info!(
                                "The connection was left in an indeterminate state, discarding it."
                            );
                            continue 'reconnect;
                        }
                    }
                },
            }
        }
    }

    triton_log::info!("Persistence daemon stopped.");
}

/// Picks the next unit of work, blocking while none is available.
///
/// A mature live save is preferred over any load; tombstoned saves drain
/// silently on the way to it. With nothing ready the worker waits on the
/// condition variable for up to one second so a delayed save matures even
/// when no producer signals. Returns `None` for the graceful exit: quit flag
/// clear and both queues empty.
fn next_work(inner: &DaemonInner) -> Option<Work> {
    let mut queues = inner.queues.lock().unwrap();
    loop {
        let now = Instant::now();

        let mut ready_save = None;
        while let Some(head) = queues.saves.front() {
            if head.deadline > now {
                break;
            }
            let item = queues.saves.pop_front().unwrap();
            if item.object.save_context().current() != item.sequence {
                // Tombstone: a newer intent superseded this one.
                continue;
            }
            ready_save = Some(item);
            break;
        }
        if let Some(item) = ready_save {
            notify_if_empty(inner, &queues);
            return Some(Work::Save(item));
        }

        if let Some(item) = queues.loads.pop_front() {
            notify_if_empty(inner, &queues);
            return Some(Work::Load(item));
        }

        // Tombstone draining may have emptied the save queue without
        // producing work.
        notify_if_empty(inner, &queues);

        if !inner.running.load(Ordering::Acquire) && queues.is_empty() {
            return None;
        }

        let (guard, _timeout) = inner
            .work_avail
            .wait_timeout(queues, Duration::from_secs(1))
            .unwrap();
        queues = guard;
    }
}

fn notify_if_empty(inner: &DaemonInner, queues: &MutexGuard<'_, Queues>) {
    if queues.is_empty() {
        inner.queues_empty.notify_all();
    }
}

/// Connect loop: first retry immediate, then 1 ms doubling up to the
/// configured cap. Returns `None` if the daemon is stopped before a
/// connection is established.
fn connect_with_backoff(inner: &DaemonInner) -> Option<Box<dyn Connection>> {
    triton_log::info!("Connecting to database server...");

    let mut delay = Duration::ZERO;
    loop {
        match inner.connector.connect(&inner.config) {
            Ok(conn) => {
                triton_log::info!("Successfully connected to database server.");
                return Some(conn);
            }
            Err(e) => triton_log::error!("Error connecting to database server: {e}"),
        }

        // The attempt comes first so a reachable server still drains queued
        // work during shutdown; only an unreachable one is abandoned.
        if !inner.running.load(Ordering::Acquire) {
            return None;
        }

        if delay.is_zero() {
            delay = Duration::from_millis(1);
        } else {
            triton_log::info!("Will retry after {} milliseconds.", delay.as_millis());
            // Sleep on the daemon condvar so stop() interrupts the backoff.
            let queues = inner.queues.lock().unwrap();
            let _ = inner.work_avail.wait_timeout(queues, delay).unwrap();
            delay = (delay * 2).min(inner.config.max_reconn_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Row;
    use crate::error::{DbError, DbResult};
    use crate::object::SaveContext;
    use std::sync::atomic::AtomicU64;

    /// Records every statement "executed" against it and can be scripted to
    /// fail connects or operations.
    struct FakeBackend {
        statements: Mutex<Vec<String>>,
        connect_attempts: Mutex<Vec<Instant>>,
        failing_connects: AtomicU64,
        failing_executes: AtomicU64,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                statements: Mutex::new(Vec::new()),
                connect_attempts: Mutex::new(Vec::new()),
                failing_connects: AtomicU64::new(0),
                failing_executes: AtomicU64::new(0),
            })
        }

        fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }

        fn connect_attempts(&self) -> usize {
            self.connect_attempts.lock().unwrap().len()
        }
    }

    struct FakeConnector(Arc<FakeBackend>);

    impl Connector for FakeConnector {
        fn connect(&self, _config: &DbConfig) -> DbResult<Box<dyn Connection>> {
            self.0.connect_attempts.lock().unwrap().push(Instant::now());
            if self.0.failing_connects.load(Ordering::SeqCst) > 0 {
                self.0.failing_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(DbError::Connect("connection refused".to_owned()));
            }
            Ok(Box::new(FakeConnection(Arc::clone(&self.0))))
        }
    }

    struct FakeConnection(Arc<FakeBackend>);

    impl Connection for FakeConnection {
        fn execute(&mut self, stmt: &str) -> DbResult<u64> {
            if self.0.failing_executes.load(Ordering::SeqCst) > 0 {
                self.0.failing_executes.fetch_sub(1, Ordering::SeqCst);
                return Err(DbError::Io("broken pipe".to_owned()));
            }
            self.0.statements.lock().unwrap().push(stmt.to_owned());
            Ok(1)
        }

        fn query(&mut self, stmt: &str) -> DbResult<Vec<Row>> {
            self.0.statements.lock().unwrap().push(stmt.to_owned());
            Ok(Vec::new())
        }
    }

    /// A counter whose save statement embeds its value at dispatch time.
    struct Counter {
        context: SaveContext,
        value: AtomicU64,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                context: SaveContext::new(),
                value: AtomicU64::new(0),
            })
        }
    }

    impl Persistable for Counter {
        fn save_context(&self) -> &SaveContext {
            &self.context
        }

        fn sync_save(&self, conn: &mut dyn Connection) -> DbResult<()> {
            let value = self.value.load(Ordering::SeqCst);
            conn.execute(&format!("REPLACE INTO counter SET value = {value}"))?;
            Ok(())
        }

        fn sync_load(&self, conn: &mut dyn Connection, filter: &str) -> DbResult<()> {
            conn.query(&format!("SELECT value FROM counter WHERE {filter}"))?;
            self.value.store(42, Ordering::SeqCst);
            Ok(())
        }
    }

    fn daemon_with(
        backend: &Arc<FakeBackend>,
        config: DbConfig,
    ) -> (PersistenceDaemon, Arc<JobPool>) {
        let jobs = JobPool::start(1);
        let daemon = PersistenceDaemon::new(
            config,
            Box::new(FakeConnector(Arc::clone(backend))),
            Arc::clone(&jobs),
        );
        (daemon, jobs)
    }

    fn short_delays() -> DbConfig {
        DbConfig::default()
            .with_save_delay(Duration::from_millis(50))
            .with_max_reconn_delay(Duration::from_millis(8))
    }

    #[test]
    fn repeated_pends_coalesce_to_one_save_with_final_state() {
        let backend = FakeBackend::new();
        let (daemon, jobs) = daemon_with(
            &backend,
            DbConfig::default().with_save_delay(Duration::from_millis(200)),
        );
        let counter = Counter::new();
        daemon.start();

        let first_pend = Instant::now();
        for value in 1..=5u64 {
            counter.value.store(value, Ordering::SeqCst);
            daemon.pend_for_saving(Arc::clone(&counter) as Arc<dyn Persistable>);
            std::thread::sleep(Duration::from_millis(10));
        }

        daemon.wait_for_all_async_operations();
        let elapsed = first_pend.elapsed();
        daemon.stop();
        jobs.stop();

        assert_eq!(
            backend.statements(),
            vec!["REPLACE INTO counter SET value = 5".to_owned()],
            "five pends within one window must produce exactly one save"
        );
        assert!(
            elapsed >= Duration::from_millis(200),
            "the save must not mature before the delay window"
        );
    }

    #[test]
    fn distinct_objects_each_save() {
        let backend = FakeBackend::new();
        let (daemon, jobs) = daemon_with(&backend, short_delays());
        daemon.start();

        let a = Counter::new();
        let b = Counter::new();
        a.value.store(1, Ordering::SeqCst);
        b.value.store(2, Ordering::SeqCst);
        daemon.pend_for_saving(Arc::clone(&a) as Arc<dyn Persistable>);
        daemon.pend_for_saving(Arc::clone(&b) as Arc<dyn Persistable>);

        daemon.wait_for_all_async_operations();
        daemon.stop();
        jobs.stop();

        assert_eq!(backend.statements().len(), 2);
    }

    #[test]
    fn load_populates_object_and_delivers_callback_on_job_pool() {
        let backend = FakeBackend::new();
        let (daemon, jobs) = daemon_with(&backend, short_delays());
        let counter = Counter::new();
        daemon.start();

        let (tx, rx) = std::sync::mpsc::channel();
        daemon.pend_for_loading(
            Arc::clone(&counter) as Arc<dyn Persistable>,
            "id = 1".to_owned(),
            Some(Box::new(move |object| {
                let _ = tx.send((
                    object.save_context().is_auto_saving(),
                    std::thread::current().name().map(str::to_owned),
                ));
            })),
        );

        let (auto_saving, thread_name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(auto_saving, "auto-save must be enabled before the callback");
        assert_ne!(
            thread_name.as_deref(),
            Some("triton-db"),
            "callbacks run on the job pool, not the daemon thread"
        );
        assert_eq!(counter.value.load(Ordering::SeqCst), 42);
        assert_eq!(
            backend.statements(),
            vec!["SELECT value FROM counter WHERE id = 1".to_owned()]
        );

        daemon.stop();
        jobs.stop();
    }

    #[test]
    fn wait_for_all_observes_empty_queues() {
        let backend = FakeBackend::new();
        let (daemon, jobs) = daemon_with(&backend, short_delays());
        daemon.start();

        let counter = Counter::new();
        for _ in 0..3 {
            daemon.pend_for_saving(Arc::clone(&counter) as Arc<dyn Persistable>);
        }
        daemon.pend_for_loading(
            Arc::clone(&counter) as Arc<dyn Persistable>,
            "id = 1".to_owned(),
            None,
        );

        daemon.wait_for_all_async_operations();
        // The contract is queue emptiness at the observation instant; with
        // the worker past the queues, no new statements can appear from the
        // drained items.
        daemon.stop();
        jobs.stop();

        let statements = backend.statements();
        assert_eq!(
            statements.len(),
            2,
            "three coalesced pends plus one load: {statements:?}"
        );
    }

    #[test]
    fn unreachable_server_backs_off_and_keeps_work_queued() {
        let backend = FakeBackend::new();
        backend.failing_connects.store(u64::MAX, Ordering::SeqCst);
        let (daemon, jobs) = daemon_with(&backend, short_delays());
        let counter = Counter::new();
        daemon.start();

        daemon.pend_for_saving(Arc::clone(&counter) as Arc<dyn Persistable>);
        std::thread::sleep(Duration::from_millis(150));

        let attempts = backend.connect_attempts();
        assert!(
            attempts >= 4,
            "immediate retry plus 1/2/4/8 ms backoff yields several attempts, got {attempts}"
        );
        assert!(
            backend.statements().is_empty(),
            "no work progresses while disconnected"
        );

        // stop() interrupts the backoff sleep promptly even though the
        // queues never drained.
        let stop_started = Instant::now();
        daemon.stop();
        jobs.stop();
        assert!(stop_started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn transport_error_discards_connection_and_reconnects() {
        let backend = FakeBackend::new();
        backend.failing_executes.store(1, Ordering::SeqCst);
        let (daemon, jobs) = daemon_with(&backend, short_delays());
        daemon.start();

        let first = Counter::new();
        first.value.store(1, Ordering::SeqCst);
        daemon.pend_for_saving(Arc::clone(&first) as Arc<dyn Persistable>);
        daemon.wait_for_all_async_operations();

        // The failed save is consumed; the next one runs on a fresh
        // connection.
        let second = Counter::new();
        second.value.store(2, Ordering::SeqCst);
        daemon.pend_for_saving(Arc::clone(&second) as Arc<dyn Persistable>);
        daemon.wait_for_all_async_operations();

        daemon.stop();
        jobs.stop();

        assert_eq!(
            backend.statements(),
            vec!["REPLACE INTO counter SET value = 2".to_owned()],
            "the erroring save is fire-and-forget"
        );
        assert!(
            backend.connect_attempts() >= 2,
            "the indeterminate connection must be replaced"
        );
    }

    #[test]
    fn stop_drains_matured_work_before_exiting() {
        let backend = FakeBackend::new();
        let (daemon, jobs) = daemon_with(&backend, short_delays());
        let counter = Counter::new();
        counter.value.store(9, Ordering::SeqCst);
        daemon.start();

        daemon.pend_for_saving(Arc::clone(&counter) as Arc<dyn Persistable>);
        daemon.stop();
        jobs.stop();

        assert_eq!(
            backend.statements(),
            vec!["REPLACE INTO counter SET value = 9".to_owned()]
        );
    }
}
