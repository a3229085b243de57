//! Per-app operation coordinator.
//!
//! Every identity is either idle, waiting for confirmation, or running
//! exactly one operation on its own worker thread:
//!
//! ```text
//! Idle -> Pending -> Running -> { Completed | Failed | Cancelled } -> Idle
//! ```
//!
//! The identity -> slot table is the only shared mutable state and sits
//! behind a single mutex. Requests and cancellations mutate it from the
//! caller's thread; a worker only clears its own slot, identified by the
//! generation it was started with.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, HomebrewBackend, NativeBackend};
use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::error::AppError;
use crate::progress::{Downloader, ProgressHandle};
use crate::resolver::Resolver;
use crate::types::{
    ActivityKind, AppIdentity, CatalogEntry, InstallState, OperationPhase, SourceKind, StateEvent,
};

/// A failed operation, as delivered to the error sink.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationFailure {
    pub identity: AppIdentity,
    pub activity: ActivityKind,
    pub error: AppError,
}

/// Sink for unrecoverable per-operation failures. Never sees cancellations.
pub trait ErrorReporter: Send + Sync {
    fn report_error(&self, failure: &OperationFailure);
}

impl<F> ErrorReporter for F
where
    F: Fn(&OperationFailure) + Send + Sync,
{
    fn report_error(&self, failure: &OperationFailure) {
        self(failure)
    }
}

/// Reports failures to the log.
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report_error(&self, failure: &OperationFailure) {
        error!(
            "{} of {} failed: {}",
            failure.activity, failure.identity, failure.error
        );
    }
}

/// The live operation for one identity.
#[derive(Clone, Debug)]
pub struct Operation {
    pub identity: AppIdentity,
    pub activity: ActivityKind,
    pub source: SourceKind,
    pub progress: ProgressHandle,
}

/// What a call to [`Coordinator::request_operation`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Waiting for [`Coordinator::confirm_operation`].
    Pending,
    Started,
    /// The same activity was already running; it has been told to stop.
    Cancelled,
}

enum Slot {
    Pending {
        entry: CatalogEntry,
        activity: ActivityKind,
    },
    Running {
        operation: Operation,
        generation: u64,
    },
}

#[derive(Default)]
struct Table {
    slots: HashMap<AppIdentity, Slot>,
    last_outcomes: HashMap<AppIdentity, (ActivityKind, OperationPhase)>,
    next_generation: u64,
}

struct Shared {
    catalog: Arc<CatalogStore>,
    resolver: Arc<Resolver>,
    backends: HashMap<SourceKind, Arc<dyn Backend>>,
    reporter: Arc<dyn ErrorReporter>,
    table: Mutex<Table>,
    subscribers: Mutex<Vec<mpsc::Sender<StateEvent>>>,
}

/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        catalog: Arc<CatalogStore>,
        resolver: Arc<Resolver>,
        reporter: Arc<dyn ErrorReporter>,
        backends: Vec<Arc<dyn Backend>>,
    ) -> Self {
        let backends = backends.into_iter().map(|b| (b.source(), b)).collect();
        Self {
            shared: Arc::new(Shared {
                catalog,
                resolver,
                backends,
                reporter,
                table: Mutex::new(Table::default()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wire the catalog store, resolver and both backends from `config`.
    ///
    /// Also applies the Homebrew `enabled` setting, removing a private
    /// toolchain left over from when the feature was on.
    pub fn from_config(config: &Config, reporter: Arc<dyn ErrorReporter>) -> Result<Self> {
        let downloader = Downloader::new(config.download.timeout(), &config.download.user_agent);
        let catalog = Arc::new(CatalogStore::from_config(config, downloader.clone()));
        let resolver = Arc::new(Resolver::new(
            catalog.clone(),
            config.native.install_root.clone(),
            config.caskroom(),
        ));
        let native = NativeBackend::new(&config.native, downloader.clone());
        let homebrew = HomebrewBackend::new(&config.homebrew, config.caskroom(), downloader);
        homebrew.reconcile()?;
        Ok(Self::new(
            catalog,
            resolver,
            reporter,
            vec![Arc::new(native), Arc::new(homebrew)],
        ))
    }

    pub fn catalog_store(&self) -> &Arc<CatalogStore> {
        &self.shared.catalog
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.shared.resolver
    }

    /// Catalog snapshot for `source`, loading it on first use.
    pub fn catalog(&self, source: SourceKind) -> Result<Arc<Vec<CatalogEntry>>, AppError> {
        if self.shared.catalog.is_loaded(source) {
            return Ok(self.shared.catalog.entries(source));
        }
        self.shared.catalog.load_catalog(source)
    }

    /// Reload `source`, replacing its snapshot.
    pub fn refresh_catalog(&self, source: SourceKind) -> Result<Arc<Vec<CatalogEntry>>, AppError> {
        self.shared.catalog.load_catalog(source)
    }

    /// Install state of `identity` in the source its catalog entry comes
    /// from (native first); uncatalogued identities resolve as native.
    pub fn install_state(&self, identity: &AppIdentity) -> InstallState {
        let source = self
            .shared
            .catalog
            .find(identity)
            .map(|e| e.source)
            .unwrap_or(SourceKind::Native);
        self.install_state_in(identity, source)
    }

    pub fn install_state_in(&self, identity: &AppIdentity, source: SourceKind) -> InstallState {
        self.shared.refresh_install_state(identity, source)
    }

    /// Ask for `activity` on `entry.identity`.
    ///
    /// Repeating the running activity cancels it; a different activity while
    /// one runs fails with [`AppError::Conflict`].
    pub fn request_operation(
        &self,
        entry: &CatalogEntry,
        activity: ActivityKind,
        needs_confirmation: bool,
    ) -> Result<RequestOutcome, AppError> {
        let backend = self.shared.backend(entry.source)?;
        let mut table = self.shared.lock_table();

        if let Some(Slot::Running { operation, .. }) = table.slots.get(&entry.identity) {
            if operation.activity != activity {
                return Err(AppError::Conflict {
                    identity: entry.identity.clone(),
                    running: operation.activity,
                    requested: activity,
                });
            }
            info!("Cancelling {} of {} on repeated request", activity, entry.identity);
            operation.progress.cancel();
            return Ok(RequestOutcome::Cancelled);
        }

        if needs_confirmation {
            table.slots.insert(
                entry.identity.clone(),
                Slot::Pending {
                    entry: entry.clone(),
                    activity,
                },
            );
            self.shared.emit(StateEvent::Operation {
                identity: entry.identity.clone(),
                activity,
                phase: OperationPhase::Pending,
            });
            return Ok(RequestOutcome::Pending);
        }

        self.start(&mut table, entry.clone(), activity, backend)?;
        Ok(RequestOutcome::Started)
    }

    /// Run a pending request. Returns `false` when nothing matching was pending.
    pub fn confirm_operation(&self, identity: &AppIdentity, activity: ActivityKind) -> bool {
        let mut table = self.shared.lock_table();
        let entry = match table.slots.get(identity) {
            Some(Slot::Pending {
                entry,
                activity: pending,
            }) if *pending == activity => entry.clone(),
            _ => {
                debug!("Nothing pending to confirm for {} {}", activity, identity);
                return false;
            }
        };
        let started = self
            .shared
            .backend(entry.source)
            .and_then(|backend| self.start(&mut table, entry, activity, backend));
        match started {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not start {} of {}: {}", activity, identity, e);
                false
            }
        }
    }

    /// Cancel whatever `identity` is doing. A pending request is dropped; a
    /// running operation is flagged and stops at its next checkpoint.
    pub fn cancel_operation(&self, identity: &AppIdentity) -> bool {
        let mut table = self.shared.lock_table();
        match table.slots.get(identity) {
            Some(Slot::Running { operation, .. }) => {
                operation.progress.cancel();
                true
            }
            Some(Slot::Pending { activity, .. }) => {
                let activity = *activity;
                table.slots.remove(identity);
                self.shared.emit(StateEvent::Operation {
                    identity: identity.clone(),
                    activity,
                    phase: OperationPhase::Idle,
                });
                true
            }
            None => false,
        }
    }

    pub fn current_operation(&self, identity: &AppIdentity) -> Option<Operation> {
        match self.shared.lock_table().slots.get(identity) {
            Some(Slot::Running { operation, .. }) => Some(operation.clone()),
            _ => None,
        }
    }

    pub fn phase(&self, identity: &AppIdentity) -> OperationPhase {
        match self.shared.lock_table().slots.get(identity) {
            Some(Slot::Pending { .. }) => OperationPhase::Pending,
            Some(Slot::Running { .. }) => OperationPhase::Running,
            None => OperationPhase::Idle,
        }
    }

    /// Activity and terminal phase of the most recent finished operation.
    pub fn last_outcome(&self, identity: &AppIdentity) -> Option<(ActivityKind, OperationPhase)> {
        self.shared.lock_table().last_outcomes.get(identity).copied()
    }

    /// Stream of operation and install-state changes.
    pub fn subscribe(&self) -> mpsc::Receiver<StateEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Block until `identity` has no running operation, up to `timeout`.
    pub fn wait_until_idle(&self, identity: &AppIdentity, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.phase(identity) != OperationPhase::Running {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn start(
        &self,
        table: &mut MutexGuard<'_, Table>,
        entry: CatalogEntry,
        activity: ActivityKind,
        backend: Arc<dyn Backend>,
    ) -> Result<(), AppError> {
        let generation = table.next_generation;
        table.next_generation += 1;
        let operation = Operation {
            identity: entry.identity.clone(),
            activity,
            source: entry.source,
            progress: ProgressHandle::new(),
        };

        let identity = operation.identity.clone();
        let worker_op = operation.clone();
        self.shared.emit(StateEvent::Operation {
            identity: identity.clone(),
            activity,
            phase: OperationPhase::Running,
        });
        table.slots.insert(
            identity.clone(),
            Slot::Running {
                operation,
                generation,
            },
        );

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", activity, identity))
            .spawn(move || shared.run(entry, worker_op, generation, backend));
        if let Err(e) = spawned {
            table.slots.remove(&identity);
            self.shared.emit(StateEvent::Operation {
                identity,
                activity,
                phase: OperationPhase::Idle,
            });
            return Err(AppError::Unknown(format!("failed to spawn worker: {}", e)));
        }
        info!("Started {} of {}", activity, identity);
        Ok(())
    }
}

impl Shared {
    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn backend(&self, source: SourceKind) -> Result<Arc<dyn Backend>, AppError> {
        self.backends
            .get(&source)
            .cloned()
            .ok_or_else(|| AppError::ToolchainMissing(format!("no backend for {} apps", source)))
    }

    fn emit(&self, event: StateEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn refresh_install_state(&self, identity: &AppIdentity, source: SourceKind) -> InstallState {
        let previous = self.resolver.cached(identity, source);
        let state = self.resolver.resolve(identity, source);
        if previous.as_ref() != Some(&state) {
            self.emit(StateEvent::InstallState {
                identity: identity.clone(),
                source,
                state: state.clone(),
            });
        }
        state
    }

    /// Worker body: run the backend call, then publish the outcome.
    fn run(
        &self,
        entry: CatalogEntry,
        operation: Operation,
        generation: u64,
        backend: Arc<dyn Backend>,
    ) {
        let progress = &operation.progress;
        let result = catch_unwind(AssertUnwindSafe(|| match operation.activity {
            ActivityKind::Install => backend.install(&entry, progress, false),
            ActivityKind::Update => backend.update(&entry, progress),
            ActivityKind::Launch => backend.launch(&entry),
            ActivityKind::Reveal => backend.reveal(&entry),
            ActivityKind::Trash => backend.delete(&entry, progress),
        }))
        .unwrap_or_else(|_| Err(AppError::Unknown("backend panicked".into()).into()));

        let phase = match result {
            Ok(()) => {
                progress.finish();
                info!("{} of {} completed", operation.activity, operation.identity);
                OperationPhase::Completed
            }
            Err(e) => {
                let error = AppError::narrow(e);
                if error.is_cancelled() || progress.is_cancelled() {
                    info!("{} of {} cancelled", operation.activity, operation.identity);
                    OperationPhase::Cancelled
                } else {
                    warn!("{} of {} failed: {}", operation.activity, operation.identity, error);
                    self.reporter.report_error(&OperationFailure {
                        identity: operation.identity.clone(),
                        activity: operation.activity,
                        error,
                    });
                    OperationPhase::Failed
                }
            }
        };

        if operation.activity.changes_install_state() {
            self.resolver.invalidate(&operation.identity, operation.source);
            self.refresh_install_state(&operation.identity, operation.source);
        }

        let mut table = self.lock_table();
        let ours = matches!(
            table.slots.get(&operation.identity),
            Some(Slot::Running { generation: g, .. }) if *g == generation
        );
        if ours {
            table.slots.remove(&operation.identity);
        }
        table
            .last_outcomes
            .insert(operation.identity.clone(), (operation.activity, phase));
        self.emit(StateEvent::Operation {
            identity: operation.identity.clone(),
            activity: operation.activity,
            phase,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that ticks `steps` times, honouring cancellation, and tracks
    /// how many calls are live per identity.
    #[derive(Default)]
    struct FakeBackend {
        steps: usize,
        fail_with: Option<AppError>,
        panic: bool,
        live: Mutex<HashMap<AppIdentity, usize>>,
        max_live: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn work(&self, entry: &CatalogEntry, progress: &ProgressHandle) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut live = self.live.lock().unwrap();
                let n = live.entry(entry.identity.clone()).or_default();
                *n += 1;
                self.max_live.fetch_max(*n, Ordering::SeqCst);
            }
            progress.set_total(self.steps as u64);
            let result = (|| -> Result<()> {
                for _ in 0..self.steps {
                    progress.check_cancelled()?;
                    thread::sleep(Duration::from_millis(2));
                    progress.advance(1);
                }
                if self.panic {
                    panic!("backend exploded");
                }
                match &self.fail_with {
                    Some(e) => Err(e.clone().into()),
                    None => Ok(()),
                }
            })();
            *self.live.lock().unwrap().get_mut(&entry.identity).unwrap() -= 1;
            result
        }
    }

    impl Backend for FakeBackend {
        fn source(&self) -> SourceKind {
            SourceKind::Native
        }
        fn install(
            &self,
            entry: &CatalogEntry,
            progress: &ProgressHandle,
            _overwrite: bool,
        ) -> Result<()> {
            self.work(entry, progress)
        }
        fn launch(&self, entry: &CatalogEntry) -> Result<()> {
            self.work(entry, &ProgressHandle::new())
        }
        fn reveal(&self, entry: &CatalogEntry) -> Result<()> {
            self.work(entry, &ProgressHandle::new())
        }
        fn delete(&self, entry: &CatalogEntry, progress: &ProgressHandle) -> Result<()> {
            self.work(entry, progress)
        }
    }

    fn stepping(steps: usize) -> FakeBackend {
        FakeBackend {
            steps,
            ..Default::default()
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        coordinator: Coordinator,
        backend: Arc<FakeBackend>,
        failures: Arc<Mutex<Vec<OperationFailure>>>,
    }

    fn harness(backend: FakeBackend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogStore::new(
            Downloader::new(Duration::from_secs(1), "test"),
            "unused",
            "unused",
        ));
        let resolver = Arc::new(Resolver::new(
            catalog.clone(),
            dir.path().join("Apps"),
            dir.path().join("Caskroom"),
        ));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let reporter: Arc<dyn ErrorReporter> =
            Arc::new(move |f: &OperationFailure| sink.lock().unwrap().push(f.clone()));
        let backend = Arc::new(backend);
        let coordinator = Coordinator::new(catalog, resolver, reporter, vec![backend.clone()]);
        Harness {
            _dir: dir,
            coordinator,
            backend,
            failures,
        }
    }

    fn entry(id: &str) -> CatalogEntry {
        CatalogEntry {
            identity: id.into(),
            source: SourceKind::Native,
            name: id.into(),
            version: "1.0".into(),
            subtitle: None,
            developer: None,
            homepage: None,
            download_url: "file:///dev/null".into(),
            sha256: None,
            size: None,
            download_count: None,
            app_bundle: None,
            categories: Vec::new(),
        }
    }

    fn settle(c: &Coordinator, id: &AppIdentity) {
        assert!(c.wait_until_idle(id, Duration::from_secs(10)), "operation never finished");
    }

    #[test]
    fn unconfirmed_request_runs_to_completion() {
        let h = harness(stepping(3));
        let events = h.coordinator.subscribe();
        let e = entry("app.demo");

        let outcome = h
            .coordinator
            .request_operation(&e, ActivityKind::Install, false)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Started);
        settle(&h.coordinator, &e.identity);

        assert_eq!(h.coordinator.phase(&e.identity), OperationPhase::Idle);
        assert!(h.coordinator.current_operation(&e.identity).is_none());
        assert_eq!(
            h.coordinator.last_outcome(&e.identity),
            Some((ActivityKind::Install, OperationPhase::Completed))
        );
        let phases: Vec<_> = events
            .try_iter()
            .filter_map(|ev| match ev {
                StateEvent::Operation { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, [OperationPhase::Running, OperationPhase::Completed]);
    }

    #[test]
    fn running_is_announced_before_any_worker_event() {
        let h = harness(FakeBackend::default());
        let events = h.coordinator.subscribe();
        let e = entry("app.demo");

        for _ in 0..20 {
            h.coordinator
                .request_operation(&e, ActivityKind::Install, false)
                .unwrap();
            settle(&h.coordinator, &e.identity);
            let first = events.try_iter().next();
            assert!(
                matches!(
                    first,
                    Some(StateEvent::Operation {
                        phase: OperationPhase::Running,
                        ..
                    })
                ),
                "{:?}",
                first
            );
            events.try_iter().for_each(drop);
        }
    }

    #[test]
    fn confirmation_gate_holds_until_confirmed() {
        let h = harness(stepping(1));
        let e = entry("app.demo");

        assert!(!h.coordinator.confirm_operation(&e.identity, ActivityKind::Install));
        let outcome = h
            .coordinator
            .request_operation(&e, ActivityKind::Install, true)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Pending);
        assert_eq!(h.coordinator.phase(&e.identity), OperationPhase::Pending);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);

        assert!(!h.coordinator.confirm_operation(&e.identity, ActivityKind::Trash));
        assert!(h.coordinator.confirm_operation(&e.identity, ActivityKind::Install));
        settle(&h.coordinator, &e.identity);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert!(!h.coordinator.confirm_operation(&e.identity, ActivityKind::Install));
    }

    #[test]
    fn cancelling_a_pending_request_returns_to_idle() {
        let h = harness(FakeBackend::default());
        let e = entry("app.demo");
        h.coordinator
            .request_operation(&e, ActivityKind::Trash, true)
            .unwrap();
        assert!(h.coordinator.cancel_operation(&e.identity));
        assert_eq!(h.coordinator.phase(&e.identity), OperationPhase::Idle);
        assert!(!h.coordinator.cancel_operation(&e.identity));
    }

    #[test]
    fn repeating_the_running_activity_cancels_it() {
        let h = harness(stepping(5_000));
        let e = entry("app.demo");

        h.coordinator
            .request_operation(&e, ActivityKind::Install, false)
            .unwrap();
        let outcome = h
            .coordinator
            .request_operation(&entry("app.demo"), ActivityKind::Install, false)
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Cancelled);
        settle(&h.coordinator, &e.identity);

        assert_eq!(
            h.coordinator.last_outcome(&e.identity),
            Some((ActivityKind::Install, OperationPhase::Cancelled))
        );
        assert!(h.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn different_activity_while_running_conflicts() {
        let h = harness(stepping(5_000));
        let e = entry("app.demo");
        h.coordinator
            .request_operation(&e, ActivityKind::Install, false)
            .unwrap();

        let err = h
            .coordinator
            .request_operation(&e, ActivityKind::Trash, false)
            .unwrap_err();
        assert_eq!(
            err,
            AppError::Conflict {
                identity: e.identity.clone(),
                running: ActivityKind::Install,
                requested: ActivityKind::Trash,
            }
        );
        assert_eq!(
            h.coordinator.current_operation(&e.identity).unwrap().activity,
            ActivityKind::Install
        );

        assert!(h.coordinator.cancel_operation(&e.identity));
        settle(&h.coordinator, &e.identity);
    }

    #[test]
    fn failures_reach_the_sink_and_clear_the_slot() {
        let h = harness(FakeBackend {
            steps: 1,
            fail_with: Some(AppError::Network("connection reset".into())),
            ..Default::default()
        });
        let e = entry("app.demo");
        h.coordinator
            .request_operation(&e, ActivityKind::Update, false)
            .unwrap();
        settle(&h.coordinator, &e.identity);

        let failures = h.failures.lock().unwrap().clone();
        assert_eq!(
            failures,
            [OperationFailure {
                identity: e.identity.clone(),
                activity: ActivityKind::Update,
                error: AppError::Network("connection reset".into()),
            }]
        );
        assert_eq!(
            h.coordinator
                .request_operation(&e, ActivityKind::Update, false)
                .unwrap(),
            RequestOutcome::Started
        );
        settle(&h.coordinator, &e.identity);
    }

    #[test]
    fn panicking_backend_is_reported_as_failure() {
        let h = harness(FakeBackend {
            panic: true,
            ..stepping(1)
        });
        let e = entry("app.demo");
        h.coordinator
            .request_operation(&e, ActivityKind::Launch, false)
            .unwrap();
        settle(&h.coordinator, &e.identity);

        assert_eq!(
            h.coordinator.last_outcome(&e.identity),
            Some((ActivityKind::Launch, OperationPhase::Failed))
        );
        assert!(matches!(
            h.failures.lock().unwrap()[0].error,
            AppError::Unknown(_)
        ));
    }

    #[test]
    fn distinct_identities_run_concurrently() {
        let h = harness(stepping(5_000));
        let (a, b) = (entry("app.a"), entry("app.b"));
        h.coordinator
            .request_operation(&a, ActivityKind::Install, false)
            .unwrap();
        h.coordinator
            .request_operation(&b, ActivityKind::Trash, false)
            .unwrap();

        assert_eq!(h.coordinator.phase(&a.identity), OperationPhase::Running);
        assert_eq!(h.coordinator.phase(&b.identity), OperationPhase::Running);

        h.coordinator.cancel_operation(&a.identity);
        h.coordinator.cancel_operation(&b.identity);
        settle(&h.coordinator, &a.identity);
        settle(&h.coordinator, &b.identity);
    }

    #[test]
    fn request_storm_never_runs_two_operations_per_identity() {
        let h = harness(stepping(3));
        let ids = ["app.a", "app.b", "app.c"];
        let activities = [
            ActivityKind::Install,
            ActivityKind::Update,
            ActivityKind::Launch,
            ActivityKind::Trash,
        ];

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let c = h.coordinator.clone();
                thread::spawn(move || {
                    for i in 0..60 {
                        let e = entry(ids[(t + i) % ids.len()]);
                        let activity = activities[(t * 7 + i * 3) % activities.len()];
                        let _ = c.request_operation(&e, activity, i % 5 == 0);
                        if i % 11 == 0 {
                            c.confirm_operation(&e.identity, activity);
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        for id in ids {
            let id = AppIdentity::from(id);
            h.coordinator.cancel_operation(&id);
            settle(&h.coordinator, &id);
        }

        assert!(h.backend.calls.load(Ordering::SeqCst) > 0);
        assert_eq!(h.backend.max_live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_backend_is_toolchain_error() {
        let h = harness(FakeBackend::default());
        let mut e = entry("firefox");
        e.source = SourceKind::Cask;
        let err = h
            .coordinator
            .request_operation(&e, ActivityKind::Install, false)
            .unwrap_err();
        assert!(matches!(err, AppError::ToolchainMissing(_)));
        assert_eq!(h.coordinator.phase(&e.identity), OperationPhase::Idle);
    }
}
