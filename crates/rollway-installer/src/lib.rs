mod backup;
mod controller;
mod fs_utils;
mod health;
mod hooks;
mod layout;
mod pointer;
mod receipts;
mod retention;
mod service;
mod store;
mod transactions;
mod types;

pub use backup::{create_backup, latest_backup, list_backups, restore_backup, stash_config};
pub use controller::{
    ActivationController, ControllerConfig, ControllerStatus, TransitionFailure, TransitionReport,
};
pub use fs_utils::{current_unix_timestamp, remove_file_if_exists};
pub use health::{
    evaluate_health_response, HealthProbe, HealthVerifier, HttpHealthProbe,
    DEFAULT_HEALTH_INTERVAL, DEFAULT_HEALTH_WINDOW, DEFAULT_PROBE_TIMEOUT,
};
pub use hooks::{
    find_hook_script, HookEnv, HookName, HookOutcome, HookRunner, HookTimeouts,
    DEFAULT_HOOK_TIMEOUT, DEFAULT_ROLLBACK_HOOK_TIMEOUT, HOOKS_DIR_NAME,
};
pub use layout::{default_data_dir, DataLayout, CURRENT_POINTER_NAME};
pub use pointer::{clear_current, read_current, set_current};
pub use receipts::{
    read_install_receipt, read_install_receipts, remove_install_receipt, write_install_receipt,
};
pub use retention::{
    clamp_keep_count, prune, prune_hook_logs, prune_transaction_history, PruneReport,
    DEFAULT_KEEP_COUNT, HOOK_LOG_KEEP, MAX_KEEP_COUNT, MIN_KEEP_COUNT, TRANSACTION_HISTORY_KEEP,
};
pub use service::{
    CommandServiceController, NoopServiceController, ServiceController, DEFAULT_READY_TIMEOUT,
};
pub use store::{InstalledVersion, PackageStore};
pub use transactions::{
    append_transaction_journal_entry, clear_active_transaction, new_txid, read_active_transaction,
    read_commit_record, read_transaction_journal, read_transaction_metadata,
    set_active_transaction, write_commit_record,
    write_transaction_metadata,
};
pub use types::{
    CommitRecord, InstallReceipt, Operation, TransactionJournalEntry, TransactionMetadata,
    TransitionState,
};
