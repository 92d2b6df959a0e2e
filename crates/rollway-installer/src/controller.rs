use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use anyhow::Result;
use rollway_core::UpdateError;
use rollway_registry::ManifestRegistry;
use semver::Version;
use thiserror::Error;
use tracing::{info, warn};

use crate::backup::{create_backup, latest_backup, restore_backup, stash_config};
use crate::fs_utils::current_unix_timestamp;
use crate::health::{HealthProbe, HealthVerifier};
use crate::hooks::{HookEnv, HookName, HookRunner, HookTimeouts};
use crate::pointer::{clear_current, read_current, set_current};
use crate::retention::{prune, PruneReport, DEFAULT_KEEP_COUNT};
use crate::service::ServiceController;
use crate::store::{InstalledVersion, PackageStore};
use crate::transactions::{
    append_transaction_journal_entry, clear_active_transaction, new_txid, read_active_transaction,
    read_commit_record, read_transaction_metadata, set_active_transaction, write_commit_record,
    write_transaction_metadata, TRANSACTION_METADATA_VERSION,
};
use crate::{
    CommitRecord, DataLayout, Operation, TransactionJournalEntry, TransactionMetadata,
    TransitionState,
};

/// Why a transition did not commit, and what it left behind.
#[derive(Debug, Error)]
#[error(
    "{operation} of {target} failed during {phase} (disk changed: {disk_changed}, rolled back: {rolled_back})"
)]
pub struct TransitionFailure {
    pub operation: Operation,
    pub target: String,
    pub phase: TransitionState,
    /// Whether the serving version or configuration may differ from before
    /// the request.
    pub disk_changed: bool,
    /// Whether an automatic rollback restored the prior version.
    pub rolled_back: bool,
    #[source]
    pub error: UpdateError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReport {
    pub txid: String,
    pub operation: Operation,
    pub version: String,
    pub previous: Option<String>,
    /// The version was already installed and was activated without fetching.
    pub reused: bool,
    pub backup: Option<PathBuf>,
    pub health_attempts: u32,
    pub pruned: Option<PruneReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: TransitionState,
    pub current: Option<String>,
    pub active: Option<TransactionMetadata>,
    pub last_commit: Option<CommitRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub hook_timeouts: HookTimeouts,
    pub verifier: HealthVerifier,
    pub keep_count: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            hook_timeouts: HookTimeouts::default(),
            verifier: HealthVerifier::default(),
            keep_count: DEFAULT_KEEP_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Phase {
    state: TransitionState,
    txid: Option<String>,
}

struct StepError {
    phase: TransitionState,
    swapped: bool,
    error: UpdateError,
}

fn before(phase: TransitionState) -> impl FnOnce(anyhow::Error) -> StepError {
    move |err| StepError {
        phase,
        swapped: false,
        error: UpdateError::classify(err),
    }
}

fn after(phase: TransitionState) -> impl FnOnce(anyhow::Error) -> StepError {
    move |err| StepError {
        phase,
        swapped: true,
        error: UpdateError::classify(err),
    }
}

struct Activated {
    reused: bool,
    backup: Option<PathBuf>,
    health_attempts: u32,
}

/// Drives install and rollback transitions, one at a time.
///
/// Exclusion is two-layered: an in-process gate rejects overlapping calls
/// before anything is touched, and the `state/transactions/active` marker
/// rejects a second process.
pub struct ActivationController {
    layout: DataLayout,
    registry: Arc<ManifestRegistry>,
    store: PackageStore,
    hooks: HookRunner,
    service: Arc<dyn ServiceController>,
    probe: Arc<dyn HealthProbe>,
    verifier: HealthVerifier,
    keep_count: usize,
    gate: Mutex<()>,
    phase: Mutex<Phase>,
}

impl ActivationController {
    pub fn new(
        layout: DataLayout,
        registry: Arc<ManifestRegistry>,
        service: Arc<dyn ServiceController>,
        probe: Arc<dyn HealthProbe>,
        config: ControllerConfig,
    ) -> Self {
        let hooks = HookRunner::new(config.hook_timeouts, layout.hook_logs_dir());
        let store = PackageStore::new(layout.clone(), registry.source(), hooks.clone());
        let phase = recorded_phase(&layout);
        Self {
            layout,
            registry,
            store,
            hooks,
            service,
            probe,
            verifier: config.verifier,
            keep_count: config.keep_count,
            gate: Mutex::new(()),
            phase: Mutex::new(phase),
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn registry(&self) -> &ManifestRegistry {
        &self.registry
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    pub fn state(&self) -> TransitionState {
        self.phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn current_version(&self) -> Result<Option<String>> {
        read_current(&self.layout)
    }

    pub fn installed(&self) -> Result<Vec<InstalledVersion>> {
        self.store.list_installed()
    }

    pub fn install(&self, version: &Version) -> Result<TransitionReport, TransitionFailure> {
        let target = version.to_string();
        let fail = |phase: TransitionState, error: UpdateError| TransitionFailure {
            operation: Operation::Install,
            target: target.clone(),
            phase,
            disk_changed: false,
            rolled_back: false,
            error,
        };

        let _gate = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(fail(TransitionState::Idle, self.in_progress_error()))
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let previous = read_current(&self.layout)
            .map_err(|err| fail(TransitionState::Idle, UpdateError::classify(err)))?;
        if previous.as_deref() == Some(target.as_str()) {
            return Err(fail(
                TransitionState::Idle,
                UpdateError::AlreadyCurrent {
                    version: target.clone(),
                },
            ));
        }

        let mut tx = Transition::begin(self, Operation::Install, &target, previous.clone())
            .map_err(|err| fail(TransitionState::Idle, UpdateError::classify(err)))?;

        match self.run_install(&mut tx, version, previous.as_deref()) {
            Ok(activated) => Ok(self.commit(tx, previous, activated)),
            Err(step) if !step.swapped => Err(self.abort(tx, step)),
            Err(step) => Err(self.recover(tx, previous, step)),
        }
    }

    /// Re-activates the version that was current before the last commit,
    /// or the newest older installed version when no commit names one.
    pub fn rollback(&self) -> Result<TransitionReport, TransitionFailure> {
        let fail = |target: &str, error: UpdateError| TransitionFailure {
            operation: Operation::Rollback,
            target: target.to_string(),
            phase: TransitionState::Idle,
            disk_changed: false,
            rolled_back: false,
            error,
        };

        let _gate = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(fail("unknown", self.in_progress_error())),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let current = match read_current(&self.layout) {
            Ok(Some(current)) => current,
            Ok(None) => {
                return Err(fail(
                    "none",
                    UpdateError::NoPreviousVersion {
                        current: "none".to_string(),
                    },
                ))
            }
            Err(err) => return Err(fail("unknown", UpdateError::classify(err))),
        };
        let target = match self.rollback_target(&current) {
            Ok(Some(target)) => target,
            Ok(None) => {
                return Err(fail(
                    "none",
                    UpdateError::NoPreviousVersion {
                        current: current.clone(),
                    },
                ))
            }
            Err(err) => return Err(fail("unknown", UpdateError::classify(err))),
        };
        if !self.store.is_installed(&target) {
            return Err(fail(
                &target,
                UpdateError::NotInstalled {
                    version: target.clone(),
                },
            ));
        }

        let mut tx = Transition::begin(self, Operation::Rollback, &target, Some(current.clone()))
            .map_err(|err| fail(&target, UpdateError::classify(err)))?;

        match self.run_rollback(&mut tx, &target, &current) {
            Ok(health_attempts) => Ok(self.commit(
                tx,
                Some(current),
                Activated {
                    reused: true,
                    backup: None,
                    health_attempts,
                },
            )),
            Err(step) if !step.swapped => Err(self.abort(tx, step)),
            Err(step) => Err(self.recover(tx, Some(current), step)),
        }
    }

    /// Clears the active marker left by a failed (or abandoned) transition.
    /// Only run this once the service has been checked by hand.
    pub fn repair(&self) -> Result<Option<TransactionMetadata>> {
        let _gate = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(self.in_progress_error().into()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let Some(txid) = read_active_transaction(&self.layout)? else {
            self.set_phase(TransitionState::Idle, None);
            return Ok(None);
        };

        let metadata = match read_transaction_metadata(&self.layout, &txid)? {
            Some(mut metadata) => {
                if metadata.state != TransitionState::Failed {
                    metadata.last_error.get_or_insert_with(|| {
                        format!("abandoned during {}", metadata.state.as_str())
                    });
                    metadata.state = TransitionState::Failed;
                }
                metadata.updated_at_unix = current_unix_timestamp();
                write_transaction_metadata(&self.layout, &metadata)?;
                Some(metadata)
            }
            None => None,
        };
        append_transaction_journal_entry(
            &self.layout,
            &txid,
            &TransactionJournalEntry {
                seq: u64::MAX,
                step: "repaired".to_string(),
                state: TransitionState::Failed,
                path: None,
                at_unix: current_unix_timestamp(),
            },
        )?;
        clear_active_transaction(&self.layout)?;
        self.set_phase(TransitionState::Idle, None);
        info!(txid = %txid, "cleared failed transition marker");
        Ok(metadata)
    }

    pub fn status(&self) -> Result<ControllerStatus> {
        let in_process = self
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let active = match read_active_transaction(&self.layout)? {
            Some(txid) => read_transaction_metadata(&self.layout, &txid)?,
            None => None,
        };
        let state = match (&active, in_process.state) {
            (_, state) if state != TransitionState::Idle => state,
            (Some(metadata), _) => metadata.state,
            (None, state) => state,
        };

        Ok(ControllerStatus {
            state,
            current: read_current(&self.layout)?,
            active,
            last_commit: read_commit_record(&self.layout)?,
        })
    }

    /// Fails with `AlreadyInProgress` while any process holds the active
    /// marker. Touches nothing on disk.
    pub fn ensure_idle(&self) -> Result<()> {
        if let Some(txid) = read_active_transaction(&self.layout)? {
            let status = read_transaction_metadata(&self.layout, &txid)?
                .map(|metadata| metadata.state.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(UpdateError::AlreadyInProgress { txid, status }.into());
        }
        Ok(())
    }

    /// Operator-invoked retention. Refused while any transition holds the
    /// marker.
    pub fn prune(&self, keep_count: usize) -> Result<PruneReport> {
        let _gate = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(self.in_progress_error().into()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        self.ensure_idle()?;
        prune(&self.store, keep_count)
    }

    fn run_install(
        &self,
        tx: &mut Transition<'_>,
        version: &Version,
        previous: Option<&str>,
    ) -> Result<Activated, StepError> {
        let target = version.to_string();
        let version_dir = self.layout.version_dir(&target);
        let reused = self.store.is_installed(&target);

        if reused {
            info!(version = %target, "version already installed; skipping fetch");
            tx.journal("reuse_installed", Some(version_dir.as_path()))
                .map_err(before(TransitionState::Fetching))?;
        } else {
            tx.enter(TransitionState::Fetching)
                .map_err(before(TransitionState::Fetching))?;
            let release = self
                .registry
                .get(version)
                .map_err(before(TransitionState::Fetching))?;
            let archive = self
                .store
                .fetch(&release)
                .map_err(before(TransitionState::Fetching))?;
            tx.journal("fetched", Some(archive.as_path()))
                .map_err(before(TransitionState::Fetching))?;

            tx.enter(TransitionState::Verifying)
                .map_err(before(TransitionState::Verifying))?;
            self.store
                .verify(&archive, &release.checksum)
                .map_err(before(TransitionState::Verifying))?;

            tx.enter(TransitionState::Extracting)
                .map_err(before(TransitionState::Extracting))?;
            let env = self.hook_env(&target, previous, None);
            let installed = self
                .store
                .extract(&archive, &release, &env)
                .map_err(before(TransitionState::Extracting))?;
            tx.journal("extracted", Some(installed.as_path()))
                .map_err(before(TransitionState::Extracting))?;
        }

        tx.enter(TransitionState::PreUpgradeHook)
            .map_err(before(TransitionState::PreUpgradeHook))?;
        let env = self.hook_env(&target, previous, Some(self.layout.backups_dir()));
        self.hooks
            .run(HookName::PreUpgrade, &version_dir, &env)
            .map_err(before(TransitionState::PreUpgradeHook))?;

        tx.enter(TransitionState::BackingUp)
            .map_err(before(TransitionState::BackingUp))?;
        let backup = create_backup(&self.layout).map_err(before(TransitionState::BackingUp))?;
        tx.set_restore_point(&backup)
            .map_err(before(TransitionState::BackingUp))?;

        tx.enter(TransitionState::Activating)
            .map_err(before(TransitionState::Activating))?;
        set_current(&self.layout, &target).map_err(before(TransitionState::Activating))?;
        tx.journal("pointer_swapped", Some(version_dir.as_path()))
            .map_err(after(TransitionState::Activating))?;

        let health_attempts = self.settle(tx, &target, previous, Some(backup.as_path()))?;
        Ok(Activated {
            reused,
            backup: Some(backup),
            health_attempts,
        })
    }

    fn run_rollback(
        &self,
        tx: &mut Transition<'_>,
        target: &str,
        current: &str,
    ) -> Result<u32, StepError> {
        let version_dir = self.layout.version_dir(target);
        let config_dir = self.layout.config_dir();

        tx.enter(TransitionState::Activating)
            .map_err(before(TransitionState::Activating))?;
        let stash = self
            .layout
            .transaction_staging_path(&tx.metadata.txid)
            .join("config");
        stash_config(&config_dir, &stash).map_err(before(TransitionState::Activating))?;
        tx.set_restore_point(&stash)
            .map_err(before(TransitionState::Activating))?;
        let snapshot = self
            .rollback_snapshot(target, current)
            .map_err(before(TransitionState::Activating))?;

        set_current(&self.layout, target).map_err(before(TransitionState::Activating))?;
        tx.journal("pointer_swapped", Some(version_dir.as_path()))
            .map_err(after(TransitionState::Activating))?;

        if let Some(snapshot) = &snapshot {
            restore_backup(snapshot, &config_dir).map_err(after(TransitionState::Activating))?;
            tx.journal("config_restored", Some(snapshot.as_path()))
                .map_err(after(TransitionState::Activating))?;
        }
        let env = self.hook_env(target, Some(current), snapshot.clone());
        self.hooks
            .run(HookName::Rollback, &version_dir, &env)
            .map_err(after(TransitionState::Activating))?;

        self.settle(tx, target, Some(current), snapshot.as_deref())
    }

    /// The post-swap half shared by install and rollback.
    fn settle(
        &self,
        tx: &mut Transition<'_>,
        target: &str,
        previous: Option<&str>,
        backup: Option<&Path>,
    ) -> Result<u32, StepError> {
        let version_dir = self.layout.version_dir(target);

        tx.enter(TransitionState::PostUpgradeHook)
            .map_err(after(TransitionState::PostUpgradeHook))?;
        let env = self.hook_env(target, previous, backup.map(Path::to_path_buf));
        self.hooks
            .run(HookName::PostUpgrade, &version_dir, &env)
            .map_err(after(TransitionState::PostUpgradeHook))?;

        tx.enter(TransitionState::Restarting)
            .map_err(after(TransitionState::Restarting))?;
        self.service
            .restart()
            .map_err(after(TransitionState::Restarting))?;

        tx.enter(TransitionState::HealthChecking)
            .map_err(after(TransitionState::HealthChecking))?;
        self.verifier
            .verify(self.probe.as_ref())
            .map_err(after(TransitionState::HealthChecking))
    }

    fn commit(
        &self,
        mut tx: Transition<'_>,
        previous: Option<String>,
        activated: Activated,
    ) -> TransitionReport {
        if let Err(err) = tx.enter(TransitionState::Committed) {
            warn!(error = %format!("{err:#}"), "failed to record commit state");
        }
        let record = CommitRecord {
            txid: tx.metadata.txid.clone(),
            operation: tx.metadata.operation,
            current: tx.metadata.target_version.clone(),
            previous: previous.clone(),
            restore_point: tx.metadata.restore_point.clone(),
            committed_at_unix: current_unix_timestamp(),
        };
        if let Err(err) = write_commit_record(&self.layout, &record) {
            warn!(error = %format!("{err:#}"), "failed to write commit record");
        }
        let report_base = (
            tx.metadata.txid.clone(),
            tx.metadata.operation,
            tx.metadata.target_version.clone(),
        );
        tx.finish(TransitionState::Committed, None, true);
        self.set_phase(TransitionState::Idle, None);

        let pruned = match prune(&self.store, self.keep_count) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "retention skipped after commit");
                None
            }
        };

        let (txid, operation, version) = report_base;
        info!(txid = %txid, operation = %operation, version = %version, "transition committed");
        TransitionReport {
            txid,
            operation,
            version,
            previous,
            reused: activated.reused,
            backup: activated.backup,
            health_attempts: activated.health_attempts,
            pruned,
        }
    }

    /// Failure before the pointer moved: nothing serving has changed.
    fn abort(&self, tx: Transition<'_>, step: StepError) -> TransitionFailure {
        let detail = step.error.to_string();
        let operation = tx.metadata.operation;
        let target = tx.metadata.target_version.clone();
        warn!(
            operation = %operation,
            target = %target,
            phase = %step.phase,
            error = %detail,
            "transition aborted before activation"
        );
        tx.finish(TransitionState::Failed, Some(detail), true);
        self.set_phase(TransitionState::Idle, None);
        TransitionFailure {
            operation,
            target,
            phase: step.phase,
            disk_changed: false,
            rolled_back: false,
            error: step.error,
        }
    }

    /// One level of automatic recovery. A failure here is terminal: the
    /// marker stays so nothing else runs until `repair`.
    fn recover(
        &self,
        mut tx: Transition<'_>,
        previous: Option<String>,
        step: StepError,
    ) -> TransitionFailure {
        let operation = tx.metadata.operation;
        let target = tx.metadata.target_version.clone();
        warn!(
            operation = %operation,
            target = %target,
            phase = %step.phase,
            error = %step.error,
            "transition failed after activation; rolling back"
        );

        match self.unwind(&mut tx, previous.as_deref()) {
            Ok(()) => {
                tx.finish(TransitionState::RolledBack, Some(step.error.to_string()), true);
                self.set_phase(TransitionState::Idle, None);
                info!(
                    target = %target,
                    restored = previous.as_deref().unwrap_or("none"),
                    "automatic rollback succeeded"
                );
                TransitionFailure {
                    operation,
                    target,
                    phase: step.phase,
                    disk_changed: false,
                    rolled_back: true,
                    error: step.error,
                }
            }
            Err(err) => {
                let reason = format!(
                    "{} during {}; recovery failed: {err:#}",
                    step.error, step.phase
                );
                let txid = tx.metadata.txid.clone();
                tx.finish(TransitionState::Failed, Some(reason.clone()), false);
                self.set_phase(TransitionState::Failed, Some(txid));
                warn!(target = %target, reason = %reason, "automatic rollback failed");
                TransitionFailure {
                    operation,
                    target,
                    phase: TransitionState::RollingBack,
                    disk_changed: true,
                    rolled_back: false,
                    error: UpdateError::RollbackFailed { reason },
                }
            }
        }
    }

    fn unwind(&self, tx: &mut Transition<'_>, previous: Option<&str>) -> Result<()> {
        tx.enter(TransitionState::RollingBack)?;
        match previous {
            Some(previous) => set_current(&self.layout, previous)?,
            None => clear_current(&self.layout)?,
        }
        tx.journal("pointer_restored", None)?;

        let restore_point = tx.metadata.restore_point.clone().map(PathBuf::from);
        if let Some(restore_point) = &restore_point {
            restore_backup(restore_point, &self.layout.config_dir())?;
            tx.journal("config_restored", Some(restore_point.as_path()))?;
        }

        let target = tx.metadata.target_version.clone();
        let hook_version = previous.unwrap_or(target.as_str());
        let env = self.hook_env(hook_version, Some(target.as_str()), restore_point);
        self.hooks.run(
            HookName::Rollback,
            &self.layout.version_dir(hook_version),
            &env,
        )?;

        if previous.is_some() {
            self.service.restart()?;
            self.verifier.verify(self.probe.as_ref())?;
        }
        Ok(())
    }

    /// The snapshot taken before the commit being undone. Falls back to the
    /// newest backup when the commit record does not lead back to `target`.
    fn rollback_snapshot(&self, target: &str, current: &str) -> Result<Option<PathBuf>> {
        let recorded = read_commit_record(&self.layout)?
            .filter(|record| {
                record.current == current && record.previous.as_deref() == Some(target)
            })
            .and_then(|record| record.restore_point)
            .map(PathBuf::from)
            .filter(|path| path.is_dir());
        match recorded {
            Some(path) => Ok(Some(path)),
            None => latest_backup(&self.layout),
        }
    }

    fn rollback_target(&self, current: &str) -> Result<Option<String>> {
        if let Some(previous) = read_commit_record(&self.layout)?.and_then(|record| record.previous)
        {
            if previous != current && self.store.is_installed(&previous) {
                return Ok(Some(previous));
            }
        }

        let installed = self.store.list_installed()?;
        let current_version = Version::parse(current).ok();
        let older = installed
            .iter()
            .filter(|entry| entry.version.to_string() != current)
            .find(|entry| {
                current_version
                    .as_ref()
                    .map_or(true, |current| entry.version < *current)
            })
            .or_else(|| {
                installed
                    .iter()
                    .find(|entry| entry.version.to_string() != current)
            });
        Ok(older.map(|entry| entry.version.to_string()))
    }

    fn hook_env(
        &self,
        version: &str,
        previous: Option<&str>,
        backup_dir: Option<PathBuf>,
    ) -> HookEnv {
        HookEnv {
            version: version.to_string(),
            previous_version: previous.map(str::to_string),
            data_dir: self.layout.root().to_path_buf(),
            config_dir: self.layout.config_dir(),
            backup_dir,
        }
    }

    fn in_progress_error(&self) -> UpdateError {
        let phase = self
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        UpdateError::AlreadyInProgress {
            txid: phase.txid.unwrap_or_else(|| "in-process".to_string()),
            status: phase.state.as_str().to_string(),
        }
    }

    fn set_phase(&self, state: TransitionState, txid: Option<String>) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = Phase { state, txid };
    }
}

/// A failed transition whose marker is still held survives restarts.
fn recorded_phase(layout: &DataLayout) -> Phase {
    let idle = Phase {
        state: TransitionState::Idle,
        txid: None,
    };
    let Ok(Some(txid)) = read_active_transaction(layout) else {
        return idle;
    };
    match read_transaction_metadata(layout, &txid) {
        Ok(Some(metadata)) if metadata.state == TransitionState::Failed => Phase {
            state: TransitionState::Failed,
            txid: Some(txid),
        },
        _ => idle,
    }
}

/// The persisted side of one in-flight transition: metadata, journal and
/// the active marker.
struct Transition<'a> {
    controller: &'a ActivationController,
    metadata: TransactionMetadata,
    seq: u64,
}

impl<'a> Transition<'a> {
    fn begin(
        controller: &'a ActivationController,
        operation: Operation,
        target: &str,
        previous: Option<String>,
    ) -> Result<Self> {
        let layout = &controller.layout;
        let txid = new_txid(operation);
        set_active_transaction(layout, &txid)?;

        let now = current_unix_timestamp();
        let metadata = TransactionMetadata {
            version: TRANSACTION_METADATA_VERSION,
            txid: txid.clone(),
            operation,
            target_version: target.to_string(),
            previous_version: previous,
            state: TransitionState::Idle,
            started_at_unix: now,
            updated_at_unix: now,
            restore_point: None,
            last_error: None,
        };
        let prepared = layout
            .ensure_base_dirs()
            .and_then(|()| write_transaction_metadata(layout, &metadata));
        if let Err(err) = prepared {
            let _ = clear_active_transaction(layout);
            return Err(err);
        }

        controller.set_phase(TransitionState::Idle, Some(txid.clone()));
        info!(txid = %txid, operation = %operation, target = %target, "transition started");
        Ok(Self {
            controller,
            metadata,
            seq: 0,
        })
    }

    fn enter(&mut self, state: TransitionState) -> Result<()> {
        self.metadata.state = state;
        self.metadata.updated_at_unix = current_unix_timestamp();
        write_transaction_metadata(&self.controller.layout, &self.metadata)?;
        self.journal(state.as_str(), None)?;
        self.controller
            .set_phase(state, Some(self.metadata.txid.clone()));
        info!(
            txid = %self.metadata.txid,
            operation = %self.metadata.operation,
            target = %self.metadata.target_version,
            state = %state,
            "transition state"
        );
        Ok(())
    }

    fn journal(&mut self, step: &str, path: Option<&Path>) -> Result<()> {
        self.seq += 1;
        append_transaction_journal_entry(
            &self.controller.layout,
            &self.metadata.txid,
            &TransactionJournalEntry {
                seq: self.seq,
                step: step.to_string(),
                state: self.metadata.state,
                path: path.map(|path| path.display().to_string()),
                at_unix: current_unix_timestamp(),
            },
        )?;
        Ok(())
    }

    fn set_restore_point(&mut self, path: &Path) -> Result<()> {
        self.metadata.restore_point = Some(path.display().to_string());
        write_transaction_metadata(&self.controller.layout, &self.metadata)?;
        self.journal("restore_point", Some(path))
    }

    /// Records the terminal state. Bookkeeping failures here are logged;
    /// the outcome has already happened.
    fn finish(mut self, state: TransitionState, error: Option<String>, release_marker: bool) {
        self.metadata.state = state;
        self.metadata.updated_at_unix = current_unix_timestamp();
        if error.is_some() {
            self.metadata.last_error = error;
        }
        let layout = &self.controller.layout;
        if let Err(err) = write_transaction_metadata(layout, &self.metadata) {
            warn!(txid = %self.metadata.txid, error = %format!("{err:#}"), "failed to record final transition state");
        }
        if let Err(err) = self.journal(state.as_str(), None) {
            warn!(txid = %self.metadata.txid, error = %format!("{err:#}"), "failed to journal final transition state");
        }
        if release_marker {
            if let Err(err) = clear_active_transaction(layout) {
                warn!(txid = %self.metadata.txid, error = %format!("{err:#}"), "failed to release transition marker");
            }
        }
    }
}
