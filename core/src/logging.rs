//! Structured log events with stable IDs, emitted both through `tracing`
//! and (when running under systemd) the journal directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Latched so we only print one local warning if journal writes keep failing.
static EMITTED_JOURNAL_ERROR: AtomicBool = AtomicBool::new(false);

/// Stable message ID for the config-merge event (§7).
pub const MSGID_CONFIG_MERGE: &str = "ostree.config-merge";
/// Stable message ID for the var relabel event (§7).
pub const MSGID_VAR_RELABEL: &str = "ostree.var-relabel";
/// Stable message ID for the deployment-complete event (§7).
pub const MSGID_DEPLOYMENT_COMPLETE: &str = "ostree.deployment-complete";

/// Wrapper over `libsystemd::logging::journal_send`, a no-op outside systemd.
fn journal_send<K, V>(priority: libsystemd::logging::Priority, msg: &str, vars: impl Iterator<Item = (K, V)>)
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if !libsystemd::daemon::booted() {
        return;
    }
    if let Err(e) = libsystemd::logging::journal_send(priority, msg, vars) {
        if !EMITTED_JOURNAL_ERROR.swap(true, Ordering::SeqCst) {
            eprintln!("failed to write to journal: {e}");
        }
    }
}

/// Log the result of a `/etc` config merge (§4.5 step 4, §7).
pub fn log_config_merge(osname: &str, modified: usize, removed: usize, added: usize) {
    tracing::info!(
        osname,
        modified,
        removed,
        added,
        "config merge: {modified} modified, {removed} removed, {added} added"
    );
    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("MESSAGE_ID", MSGID_CONFIG_MERGE.to_string());
    vars.insert("OSNAME", osname.to_string());
    vars.insert("MODIFIED", modified.to_string());
    vars.insert("REMOVED", removed.to_string());
    vars.insert("ADDED", added.to_string());
    journal_send(
        libsystemd::logging::Priority::Info,
        &format!("config merge for {osname}: {modified} modified, {removed} removed, {added} added"),
        vars.into_iter(),
    );
}

/// Log that `/var` was relabeled for the first time under a deployment.
pub fn log_var_relabel(osname: &str, csum: &str) {
    tracing::info!(osname, csum, "relabeled /var");
    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("MESSAGE_ID", MSGID_VAR_RELABEL.to_string());
    vars.insert("OSNAME", osname.to_string());
    vars.insert("CSUM", csum.to_string());
    journal_send(
        libsystemd::logging::Priority::Info,
        &format!("relabeled /var for {osname}"),
        vars.into_iter(),
    );
}

/// Log the writer's final summary line (§7).
pub fn log_deployment_complete(bootconfig_swap: bool, deployment_delta: i64) {
    tracing::info!(
        bootconfig_swap,
        deployment_delta,
        "deployment write complete"
    );
    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("MESSAGE_ID", MSGID_DEPLOYMENT_COMPLETE.to_string());
    vars.insert("BOOTCONFIG_SWAP", bootconfig_swap.to_string());
    vars.insert("DEPLOYMENT_DELTA", deployment_delta.to_string());
    journal_send(
        libsystemd::logging::Priority::Info,
        &format!(
            "deployment write complete: bootconfig-swap={bootconfig_swap} deployments-delta={deployment_delta:+}"
        ),
        vars.into_iter(),
    );
}
