//! The table reconciler.
//!
//! [`Table`] caches the desired state of one nftables table and brings the
//! kernel into line with it when `apply` is called.  Key properties:
//! - Rules are recognised on read-back by the fingerprint in their comment,
//!   never by parsing rule bodies.
//! - Unchanged rules are left alone so their packet counters survive.
//! - After every write the dataplane is re-read at exponentially spaced
//!   intervals to detect and repair foreign modifications.
//! - Chains are reference-counted from the kernel base chains; unreferenced
//!   chains are never programmed and are deleted once they become
//!   unreachable.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, error, info, warn};

use nft_driver::{
    BaseChainSpec, ChainType, CmdRunner, Family, HookPoint, ListedRule, NftBackend, NftError,
};

use crate::features::FeatureDetector;
use crate::hash::{append_seed, rule_hashes};
use crate::metrics::TableMetrics;
use crate::noop::ReconcilerTable;
use crate::rule::{Chain, Rule};
use crate::shim::{Clock, NoopRecorder, OpRecorder, SystemClock};

const MIN_POST_WRITE_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POST_WRITE_INTERVAL: Duration = Duration::from_secs(3600);

const WRITE_RETRIES: u32 = 10;
const READ_RETRIES: u32 = 3;

const TRANSITION_LOG_INTERVAL: Duration = Duration::from_secs(30);
const TRANSITION_LOG_BURST: u32 = 100;

/// Sentinel fingerprint for rules that carry no recognised hash comment but
/// match the legacy cleanup pattern.  Never equal to a real fingerprint, so
/// the owning chain always reads as out of sync and the rule gets swept.
const LEGACY_INSERT_HASH: &str = "LEGACY-INSERT";

/// Whether hook rules go at the top or the bottom of hook chains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InsertMode {
    #[default]
    Insert,
    Append,
}

/// Constructor options.  Everything has a usable default except
/// `historic_chain_prefixes`, which must name at least one prefix.
pub struct TableOptions {
    /// Prefixes identifying chains owned by this or prior versions.
    pub historic_chain_prefixes: Vec<String>,
    /// Extra pattern recognising legacy rules to clean out of hook chains.
    /// Matched against each rule's comment and its expression JSON.
    pub extra_cleanup_regex: Option<String>,
    pub insert_mode: InsertMode,
    /// Periodic forced re-read cadence; `None` disables.
    pub refresh_interval: Option<Duration>,
    /// Initial delay before the first post-write recheck.  Clamped to at
    /// least 50ms.
    pub post_write_interval: Duration,
    /// Invoked before each kernel read and each write retry so the host can
    /// feed its watchdog during long operations.
    pub on_still_alive: Option<Box<dyn FnMut() + Send + Sync>>,
    pub op_recorder: Option<Box<dyn OpRecorder + Send>>,
    /// Clock override for tests.
    pub clock: Option<Arc<dyn Clock>>,
    /// Subprocess override, used for the diagnostic dump on fatal errors.
    pub cmd_runner: Option<Arc<dyn CmdRunner>>,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            historic_chain_prefixes: Vec::new(),
            extra_cleanup_regex: None,
            insert_mode: InsertMode::default(),
            refresh_interval: None,
            post_write_interval: MIN_POST_WRITE_INTERVAL,
            on_still_alive: None,
            op_recorder: None,
            clock: None,
            cmd_runner: None,
        }
    }
}

/// The kernel base chains each table kind hooks, with their hook points and
/// standard netfilter priorities.  Table names may carry a deployment
/// prefix; the kind is the suffix after the last `-`.
fn kernel_base_chains(table_name: &str) -> &'static [(&'static str, ChainType, HookPoint, i32)] {
    let kind = table_name.rsplit('-').next().unwrap_or(table_name);
    match kind {
        "filter" => &[
            ("INPUT", ChainType::Filter, HookPoint::Input, 0),
            ("FORWARD", ChainType::Filter, HookPoint::Forward, 0),
            ("OUTPUT", ChainType::Filter, HookPoint::Output, 0),
        ],
        "nat" => &[
            ("PREROUTING", ChainType::Nat, HookPoint::Prerouting, -100),
            ("INPUT", ChainType::Nat, HookPoint::Input, 100),
            ("OUTPUT", ChainType::Nat, HookPoint::Output, -100),
            ("POSTROUTING", ChainType::Nat, HookPoint::Postrouting, 100),
        ],
        "mangle" => &[
            ("PREROUTING", ChainType::Filter, HookPoint::Prerouting, -150),
            ("INPUT", ChainType::Filter, HookPoint::Input, -150),
            ("FORWARD", ChainType::Filter, HookPoint::Forward, -150),
            ("OUTPUT", ChainType::Filter, HookPoint::Output, -150),
            ("POSTROUTING", ChainType::Filter, HookPoint::Postrouting, -150),
        ],
        "raw" => &[
            ("PREROUTING", ChainType::Filter, HookPoint::Prerouting, -300),
            ("OUTPUT", ChainType::Filter, HookPoint::Output, -300),
        ],
        _ => &[],
    }
}

/// Jump/goto targets named by a rule list.
fn referred_chains(rules: &[Rule]) -> Vec<String> {
    rules
        .iter()
        .filter_map(|r| r.action.as_ref().and_then(|a| a.referenced_chain()))
        .map(str::to_string)
        .collect()
}

/// Interval+burst limiter for the refcount transition logs; endpoint churn
/// can flip thousands of chains per second.
struct RateLimitedLog {
    interval: Duration,
    burst: u32,
    tokens: u32,
    window_start: Option<Instant>,
}

impl RateLimitedLog {
    fn new(interval: Duration, burst: u32) -> RateLimitedLog {
        RateLimitedLog {
            interval,
            burst,
            tokens: burst,
            window_start: None,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        match self.window_start {
            None => self.window_start = Some(now),
            Some(start) if now.saturating_duration_since(start) >= self.interval => {
                self.window_start = Some(now);
                self.tokens = self.burst;
            }
            _ => {}
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// Reconciler for a single nftables table.
///
/// No internal synchronisation: all methods must be called from the owning
/// event loop's thread.  Run exactly one instance per (table, IP version)
/// pair per process.
pub struct Table {
    name: String,
    ip_version: u8,
    family: Family,
    backend: Box<dyn NftBackend>,
    feature_detector: Arc<dyn FeatureDetector>,

    // Desired state.
    chain_to_inserted_rules: HashMap<String, Vec<Rule>>,
    chain_to_appended_rules: HashMap<String, Vec<Rule>>,
    chain_name_to_chain: HashMap<String, Chain>,

    // Refcounts from the kernel base chains.  A chain is programmed iff its
    // count is >= 1; a count of zero is represented by absence.
    chain_ref_counts: HashMap<String, usize>,

    dirty_chains: BTreeSet<String>,
    dirty_insert_append: BTreeSet<String>,

    // Observed state: what we believe is in the kernel.
    in_sync_with_dataplane: bool,
    chain_to_dataplane_hashes: HashMap<String, Vec<String>>,
    chain_to_full_rules: HashMap<String, Vec<ListedRule>>,

    hash_comment_prefix: String,
    hash_comment_regex: Regex,
    our_chains_regex: Regex,
    legacy_insert_regex: Regex,

    insert_mode: InsertMode,

    last_read_time: Option<Instant>,
    last_write_time: Instant,
    initial_post_write_interval: Duration,
    post_write_interval: Duration,
    refresh_interval: Option<Duration>,

    // Peak observed nft round-trip times; decay 1% per observation.
    peak_read_time: Duration,
    peak_write_time: Duration,

    metrics: Arc<TableMetrics>,
    clock: Arc<dyn Clock>,
    exec: Arc<dyn CmdRunner>,
    on_still_alive: Box<dyn FnMut() + Send + Sync>,
    op_recorder: Box<dyn OpRecorder + Send>,
    transition_log: RateLimitedLog,
    invalidation_reason: &'static str,
}

impl Table {
    /// Build a reconciler.  `hash_prefix` is the constant prepended to every
    /// fingerprint comment (e.g. `"fw:"`).
    ///
    /// Panics if `options.historic_chain_prefixes` is empty; without it the
    /// reconciler cannot tell its own chains from foreign ones.
    pub fn new(
        name: &str,
        ip_version: u8,
        hash_prefix: &str,
        backend: Box<dyn NftBackend>,
        feature_detector: Arc<dyn FeatureDetector>,
        options: TableOptions,
    ) -> Table {
        if options.historic_chain_prefixes.is_empty() {
            panic!("historic_chain_prefixes must not be empty");
        }

        let hash_comment_regex =
            Regex::new(&format!("^{}([A-Za-z0-9_-]+)", regex::escape(hash_prefix))).unwrap();
        let our_chains_pattern = format!(
            "^(?:{})",
            options
                .historic_chain_prefixes
                .iter()
                .map(|p| regex::escape(p))
                .collect::<Vec<_>>()
                .join("|")
        );
        let our_chains_regex = Regex::new(&our_chains_pattern).unwrap();

        // Jumps to our chains that lost their hash comment (rules written by
        // old versions) show up in the listing's expression JSON.
        let mut legacy_parts: Vec<String> = options
            .historic_chain_prefixes
            .iter()
            .map(|p| format!("\"target\":\"{}", regex::escape(p)))
            .collect();
        if let Some(extra) = &options.extra_cleanup_regex {
            legacy_parts.push(extra.clone());
        }
        let legacy_pattern = legacy_parts.join("|");
        info!(table = name, pattern = %legacy_pattern, "Calculated legacy rule detection regex");
        let legacy_insert_regex = Regex::new(&legacy_pattern).unwrap();

        // Pre-populate the insert/append maps for the kernel chains and mark
        // them dirty so rules hooked by a previous run get cleaned up.
        let mut inserts = HashMap::new();
        let mut appends = HashMap::new();
        let mut dirty_insert_append = BTreeSet::new();
        let mut refcounts = HashMap::new();
        for (chain, _, _, _) in kernel_base_chains(name) {
            inserts.insert(chain.to_string(), Vec::new());
            appends.insert(chain.to_string(), Vec::new());
            dirty_insert_append.insert(chain.to_string());
            // Kernel chains are referred to by definition.
            *refcounts.entry(chain.to_string()).or_insert(0) += 1;
        }

        let post_write_interval = if options.post_write_interval < MIN_POST_WRITE_INTERVAL {
            info!(
                set_value = ?options.post_write_interval,
                default = ?MIN_POST_WRITE_INTERVAL,
                "Post-write interval too small, defaulting"
            );
            MIN_POST_WRITE_INTERVAL
        } else {
            options.post_write_interval
        };

        let clock = options.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let exec = options.cmd_runner.unwrap_or_else(nft_driver::real_cmd_runner);
        let now = clock.now();

        Table {
            name: name.to_string(),
            ip_version,
            family: Family::from_ip_version(ip_version),
            backend,
            feature_detector,
            chain_to_inserted_rules: inserts,
            chain_to_appended_rules: appends,
            chain_name_to_chain: HashMap::new(),
            chain_ref_counts: refcounts,
            dirty_chains: BTreeSet::new(),
            dirty_insert_append,
            in_sync_with_dataplane: false,
            chain_to_dataplane_hashes: HashMap::new(),
            chain_to_full_rules: HashMap::new(),
            hash_comment_prefix: hash_prefix.to_string(),
            hash_comment_regex,
            our_chains_regex,
            legacy_insert_regex,
            insert_mode: options.insert_mode,
            last_read_time: None,
            // Treat construction as a write so the post-write recheck
            // cadence starts immediately and covers state left behind by a
            // previous process.
            last_write_time: now,
            initial_post_write_interval: post_write_interval,
            post_write_interval,
            refresh_interval: options.refresh_interval,
            peak_read_time: Duration::ZERO,
            peak_write_time: Duration::ZERO,
            metrics: Arc::new(TableMetrics::new()),
            clock,
            exec,
            on_still_alive: options.on_still_alive.unwrap_or_else(|| Box::new(|| {})),
            op_recorder: options
                .op_recorder
                .unwrap_or_else(|| Box::new(NoopRecorder)),
            transition_log: RateLimitedLog::new(TRANSITION_LOG_INTERVAL, TRANSITION_LOG_BURST),
            invalidation_reason: "startup",
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_version(&self) -> u8 {
        self.ip_version
    }

    /// Handle to this table's counters and gauges.
    pub fn metrics(&self) -> Arc<TableMetrics> {
        self.metrics.clone()
    }

    /// Set the rules hooked into the given non-owned chain.  Depending on
    /// the insert mode they go at the top (`Insert`) or the bottom
    /// (`Append`) of the chain.
    ///
    /// Trust boundary: when the hook chain drifts out of sync it is flushed
    /// and rebuilt, which also evicts rules other processes inserted there.
    pub fn insert_or_append_rules(&mut self, chain_name: &str, rules: Vec<Rule>) {
        debug!(chain = chain_name, "Updating rule insertions");
        let old_rules = self
            .chain_to_inserted_rules
            .insert(chain_name.to_string(), rules.clone())
            .unwrap_or_default();
        self.metrics
            .add_rules(rules.len() as i64 - old_rules.len() as i64);
        self.dirty_insert_append.insert(chain_name.to_string());

        // Incref the new targets before decreffing the old ones so a
        // still-referenced child is never transiently marked dirty.
        self.maybe_incref_referred_chains(chain_name, &rules);
        self.maybe_decref_referred_chains(chain_name, &old_rules);

        // Hook chains are contended with other applications; re-read their
        // state before the next write.
        self.invalidate_dataplane_cache("insertion");
    }

    /// Set the rules always appended to the end of the given non-owned
    /// chain, after any insert-mode rules.
    pub fn append_rules(&mut self, chain_name: &str, rules: Vec<Rule>) {
        debug!(chain = chain_name, "Updating rule appends");
        let old_rules = self
            .chain_to_appended_rules
            .insert(chain_name.to_string(), rules.clone())
            .unwrap_or_default();
        self.metrics
            .add_rules(rules.len() as i64 - old_rules.len() as i64);
        self.dirty_insert_append.insert(chain_name.to_string());

        self.maybe_incref_referred_chains(chain_name, &rules);
        self.maybe_decref_referred_chains(chain_name, &old_rules);

        self.invalidate_dataplane_cache("insertion");
    }

    /// Add or replace a fully-owned chain in the desired state.  The chain
    /// is only programmed once something reachable from a kernel chain
    /// refers to it.
    pub fn update_chain(&mut self, chain: Chain) {
        debug!(chain = %chain.name, "Adding chain to available set");
        self.reject_reference_cycles(&chain);

        // Incref before decref, as above.
        self.maybe_incref_referred_chains(&chain.name, &chain.rules);
        let old_rules: Option<Vec<Rule>> = self
            .chain_name_to_chain
            .get(&chain.name)
            .map(|c| c.rules.clone());
        if let Some(old_rules) = &old_rules {
            self.maybe_decref_referred_chains(&chain.name, old_rules);
        }
        let old_num_rules = old_rules.map(|r| r.len()).unwrap_or(0);
        self.metrics
            .add_rules(chain.rules.len() as i64 - old_num_rules as i64);

        let name = chain.name.clone();
        self.chain_name_to_chain.insert(name.clone(), chain);
        if self.chain_is_referenced(&name) {
            self.dirty_chains.insert(name);
            self.invalidate_dataplane_cache("chain update");
        }
    }

    pub fn update_chains(&mut self, chains: Vec<Chain>) {
        for chain in chains {
            self.update_chain(chain);
        }
    }

    /// Drop a chain from the desired state.  If it is still referenced it
    /// is marked dirty so the next apply deletes it from the kernel.
    pub fn remove_chain_by_name(&mut self, name: &str) {
        debug!(chain = name, "Removing chain from available set");
        if let Some(old_chain) = self.chain_name_to_chain.remove(name) {
            self.metrics.add_rules(-(old_chain.rules.len() as i64));
            self.maybe_decref_referred_chains(name, &old_chain.rules);
            if self.chain_is_referenced(name) {
                self.dirty_chains.insert(name.to_string());
                self.invalidate_dataplane_cache("chain removal");
            }
        }
    }

    pub fn remove_chains(&mut self, chains: &[Chain]) {
        for chain in chains {
            self.remove_chain_by_name(&chain.name);
        }
    }

    /// Force a dataplane re-read before the next apply.
    pub fn invalidate_dataplane_cache(&mut self, reason: &'static str) {
        if !self.in_sync_with_dataplane {
            debug!(reason, "Would invalidate dataplane cache but it was already invalid");
            return;
        }
        debug!(reason, "Invalidating dataplane cache");
        self.in_sync_with_dataplane = false;
        self.invalidation_reason = reason;
    }

    fn chain_is_referenced(&self, name: &str) -> bool {
        self.chain_ref_counts.get(name).copied().unwrap_or(0) > 0
    }

    /// The desired chain, if and only if it exists and something refers to
    /// it.  Unreferenced chains are treated as absent.
    fn desired_state_of_chain(&self, chain_name: &str) -> Option<&Chain> {
        if !self.chain_is_referenced(chain_name) {
            return None;
        }
        self.chain_name_to_chain.get(chain_name)
    }

    /// The refcount scheme requires a DAG; a cycle would pin dead chains
    /// forever.  The policy renderer never emits cycles, so hitting one is a
    /// caller bug.
    fn reject_reference_cycles(&self, chain: &Chain) {
        let mut pending = referred_chains(&chain.rules);
        let mut visited: BTreeSet<String> = BTreeSet::new();
        while let Some(name) = pending.pop() {
            if name == chain.name {
                panic!(
                    "reference cycle involving chain {}; chain graphs must be acyclic",
                    chain.name
                );
            }
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(next) = self.chain_name_to_chain.get(&name) {
                pending.extend(referred_chains(&next.rules));
            }
        }
    }

    fn maybe_incref_referred_chains(&mut self, chain_name: &str, rules: &[Rule]) {
        if !self.chain_is_referenced(chain_name) {
            return;
        }
        for target in referred_chains(rules) {
            self.incref_chain(&target);
        }
    }

    fn maybe_decref_referred_chains(&mut self, chain_name: &str, rules: &[Rule]) {
        if !self.chain_is_referenced(chain_name) {
            return;
        }
        for target in referred_chains(rules) {
            self.decref_chain(&target);
        }
    }

    fn incref_chain(&mut self, chain_name: &str) {
        debug!(chain = chain_name, "Incref chain");
        let new_count = {
            let count = self
                .chain_ref_counts
                .entry(chain_name.to_string())
                .or_insert(0);
            *count += 1;
            *count
        };
        if new_count == 1 {
            let now = self.clock.now();
            if self.transition_log.allow(now) {
                info!(chain = chain_name, "Chain became referenced, marking it for programming");
            }
            self.dirty_chains.insert(chain_name.to_string());
            if let Some(chain) = self.chain_name_to_chain.get(chain_name) {
                // Newly live: everything it refers to is live too.
                let child_rules = chain.rules.clone();
                self.maybe_incref_referred_chains(chain_name, &child_rules);
            }
        }
    }

    fn decref_chain(&mut self, chain_name: &str) {
        debug!(chain = chain_name, "Decref chain");
        let count = self.chain_ref_counts.get(chain_name).copied().unwrap_or(0);
        if count <= 1 {
            let now = self.clock.now();
            if self.transition_log.allow(now) {
                info!(chain = chain_name, "Chain no longer referenced, marking it for removal");
            }
            if let Some(chain) = self.chain_name_to_chain.get(chain_name) {
                let child_rules = chain.rules.clone();
                self.maybe_decref_referred_chains(chain_name, &child_rules);
            }
            self.chain_ref_counts.remove(chain_name);
            self.dirty_chains.insert(chain_name.to_string());
            return;
        }
        if let Some(count) = self.chain_ref_counts.get_mut(chain_name) {
            *count -= 1;
        }
    }

    /// Reconcile the kernel with the cached desired state.
    ///
    /// Runs at most one transaction.  Returns a hint for when the caller
    /// should schedule the next apply, driven by the refresh timer and the
    /// post-write recheck deadline.
    pub async fn apply(&mut self) -> Duration {
        let start = self.clock.now();
        let now = start;

        if let Some(refresh_interval) = self.refresh_interval {
            let overdue = match self.last_read_time {
                Some(last) => now.saturating_duration_since(last) > refresh_interval,
                None => true,
            };
            if overdue {
                self.invalidate_dataplane_cache("refresh timer");
            }
        }

        // Exponentially spaced post-write rechecks catch foreign processes
        // that clobber our updates.
        while !self.post_write_interval.is_zero()
            && self.post_write_interval < MAX_POST_WRITE_INTERVAL
            && now >= self.last_write_time + self.post_write_interval
        {
            self.post_write_interval *= 2;
            debug!(
                new_post_write_interval = ?self.post_write_interval,
                "Updating post-write interval"
            );
            self.invalidate_dataplane_cache("post update");
        }

        // Retry until we succeed: concurrent writers can invalidate our
        // transaction, and state clobbered by another process shows up as
        // inconsistencies in what we try to program.  If we are still
        // failing after ten rounds we are probably writing bad data; give
        // up loudly rather than run with unknown kernel state.
        let mut retries = WRITE_RETRIES;
        let mut backoff = Duration::from_millis(1);
        let mut failed_at_least_once = false;
        loop {
            if !self.in_sync_with_dataplane {
                self.load_dataplane_state().await;
            }
            (self.on_still_alive)();
            match self.apply_updates().await {
                Ok(()) => {
                    if failed_at_least_once {
                        warn!("Succeeded after retry");
                    }
                    break;
                }
                Err(err) if retries > 0 => {
                    retries -= 1;
                    warn!(error = %err, "Failed to program nftables, will retry");
                    self.clock.sleep(backoff).await;
                    backoff *= 2;
                    failed_at_least_once = true;
                }
                Err(err) => {
                    error!(error = %err, "Failed to program nftables, loading diags before panic");
                    self.dump_diagnostics().await;
                    panic!(
                        "failed to program nftables table {} after retries: {err}",
                        self.name
                    );
                }
            }
        }

        self.metrics
            .set_num_chains(self.chain_ref_counts.len() as u64);

        let mut reschedule_after = Duration::ZERO;
        if let (Some(refresh_interval), Some(last_read)) =
            (self.refresh_interval, self.last_read_time)
        {
            let since_read = now.saturating_duration_since(last_read);
            reschedule_after = refresh_interval.saturating_sub(since_read);
        }
        if self.post_write_interval < MAX_POST_WRITE_INTERVAL {
            let recheck_deadline = self.last_write_time + self.post_write_interval;
            if recheck_deadline <= now {
                reschedule_after = Duration::from_millis(1);
            } else {
                let until_recheck = recheck_deadline - now;
                if self.refresh_interval.is_none() || until_recheck < reschedule_after {
                    reschedule_after = until_recheck;
                }
            }
        }

        let elapsed = self.clock.now() - start;
        if elapsed > Duration::from_secs(1) {
            info!(
                apply_time = ?elapsed,
                reason = self.invalidation_reason,
                "Updating nftables took >1s"
            );
        }
        reschedule_after
    }

    /// Returns the subset of `rules` whose fingerprints are already present
    /// in the given chain in the kernel.  Used during bootstrap to probe
    /// whether a previous process programmed equivalent rules.
    pub async fn check_rules_present(&mut self, chain: &str, rules: &[Rule]) -> Vec<Rule> {
        let features = self.feature_detector.features();
        let hashes = rule_hashes(chain, rules, &features);
        let (dataplane_hashes, _) = self.get_hashes_and_rules_from_dataplane().await;
        let present: BTreeSet<&str> = dataplane_hashes
            .get(chain)
            .map(|hs| hs.iter().map(String::as_str).collect())
            .unwrap_or_default();
        rules
            .iter()
            .zip(hashes.iter())
            .filter(|(_, hash)| present.contains(hash.as_str()))
            .map(|(rule, _)| rule.clone())
            .collect()
    }

    /// Insert rules immediately, bypassing the cache and dirty tracking.
    /// For startup bootstrapping only, before the full desired state is
    /// known.  Errors are returned, not retried.
    pub async fn insert_rules_now(&mut self, chain: &str, rules: &[Rule]) -> Result<(), NftError> {
        let features = self.feature_detector.features();
        let hashes = rule_hashes(chain, rules, &features);

        let mut tx = self.backend.new_transaction();
        tx.add_table();
        for (rule, hash) in rules.iter().zip(hashes.iter()) {
            tx.insert_rule(rule.render(chain, &self.comment_fragment(hash), &features));
        }

        self.metrics.inc_write_calls();
        match self.backend.run(&tx).await {
            Ok(()) => {
                self.metrics.add_lines_executed(tx.num_ops() as u64);
                Ok(())
            }
            Err(err) => {
                self.metrics.inc_write_errors();
                error!(tx = %tx.render(), error = %err, "Failed to run bootstrap insert transaction");
                Err(err)
            }
        }
    }

    fn comment_fragment(&self, hash: &str) -> String {
        format!("{}{}", self.hash_comment_prefix, hash)
    }

    /// Read the kernel's view of the table and mark anything that disagrees
    /// with our expectations as dirty.
    async fn load_dataplane_state(&mut self) {
        self.feature_detector.refresh();
        debug!("Loading current nftables state and checking it is correct");
        let op = format!("resync-{}-v{}", self.name, self.ip_version);
        self.op_recorder.record(&op);

        self.last_read_time = Some(self.clock.now());
        let (dataplane_hashes, dataplane_rules) =
            self.get_hashes_and_rules_from_dataplane().await;

        // Check the rules we think we have programmed are still there.
        let mut out_of_sync_chains: Vec<String> = Vec::new();
        let mut out_of_sync_inserts: Vec<String> = Vec::new();
        for (chain_name, expected_hashes) in &self.chain_to_dataplane_hashes {
            if self.dirty_chains.contains(chain_name)
                || self.dirty_insert_append.contains(chain_name)
            {
                // An update is already pending; no point flagging it.
                debug!(chain = %chain_name, "Skipping known-dirty chain");
                continue;
            }
            let dp_hashes = dataplane_hashes
                .get(chain_name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if !self.our_chains_regex.is_match(chain_name) {
                // Not one of our chains, so possibly one we hook rules into.
                let inserted = self
                    .chain_to_inserted_rules
                    .get(chain_name)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let appended = self
                    .chain_to_appended_rules
                    .get(chain_name)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                if inserted.is_empty() && appended.is_empty() {
                    // Nothing of ours should be here; also covers a chain
                    // that was removed entirely.
                    if dp_hashes.iter().any(|h| !h.is_empty()) {
                        warn!(chain = %chain_name, actual = ?dp_hashes,
                            "Chain had unexpected inserts, marking for resync");
                        out_of_sync_inserts.push(chain_name.clone());
                    }
                    continue;
                }

                // Recompute the expected layout against the chain's current
                // foreign rule count; other processes add and remove rules
                // here and shift the numbers.
                let num_foreign = dp_hashes.iter().filter(|h| h.is_empty()).count();
                let (expected, _, _) =
                    self.expected_hashes_for_insert_append_chain(chain_name, num_foreign);
                if expected.as_slice() != dp_hashes {
                    warn!(chain = %chain_name, expected = ?expected, actual = ?dp_hashes,
                        "Detected out-of-sync inserts, marking for resync");
                    out_of_sync_inserts.push(chain_name.clone());
                }
            } else if expected_hashes.as_slice() != dp_hashes {
                // One of our chains; must match exactly.
                warn!(chain = %chain_name, "Detected out-of-sync owned chain, marking for resync");
                out_of_sync_chains.push(chain_name.clone());
            }
        }
        self.dirty_chains.extend(out_of_sync_chains);
        self.dirty_insert_append.extend(out_of_sync_inserts);

        // Now scan for chains that shouldn't be there at all.
        debug!("Scanning for unexpected chains");
        for (chain_name, dp_hashes) in &dataplane_hashes {
            if self.dirty_chains.contains(chain_name)
                || self.dirty_insert_append.contains(chain_name)
            {
                continue;
            }
            if self.chain_to_dataplane_hashes.contains_key(chain_name) {
                // Expected chain, contents checked above.
                continue;
            }
            if !self.our_chains_regex.is_match(chain_name) {
                // Foreign chain we've never tracked; it may still hold
                // inserts from a previous run of ours.
                if dp_hashes.iter().any(|h| !h.is_empty()) {
                    info!(chain = %chain_name, "Found unexpected insert, marking for cleanup");
                    self.dirty_insert_append.insert(chain_name.clone());
                }
                continue;
            }
            info!(chain = %chain_name, "Found unexpected chain, marking for cleanup");
            self.dirty_chains.insert(chain_name.clone());
        }

        debug!("Finished loading nftables state");
        self.chain_to_dataplane_hashes = dataplane_hashes;
        self.chain_to_full_rules = dataplane_rules;
        self.in_sync_with_dataplane = true;
    }

    /// List the table, retrying transient failures.  Persistent failure is
    /// fatal: without a view of the kernel we cannot safely write to it.
    async fn get_hashes_and_rules_from_dataplane(
        &mut self,
    ) -> (HashMap<String, Vec<String>>, HashMap<String, Vec<ListedRule>>) {
        let mut retries = READ_RETRIES;
        let mut retry_delay = Duration::from_millis(100);
        loop {
            (self.on_still_alive)();
            let start = self.clock.now();
            let attempt = self.attempt_get_hashes_and_rules().await;
            let read_duration = self.clock.now() - start;
            self.peak_read_time = self.peak_read_time * 99 / 100;
            if read_duration > self.peak_read_time {
                debug!(duration = ?read_duration, "Updating peak nft read time");
                self.peak_read_time = read_duration;
            }
            match attempt {
                Ok(result) => {
                    self.metrics.inc_read_calls();
                    return result;
                }
                Err(err) if retries > 0 => {
                    retries -= 1;
                    self.metrics.inc_read_errors();
                    warn!(error = %err, "nft list command failed");
                    self.clock.sleep(retry_delay).await;
                    retry_delay *= 2;
                }
                Err(err) => {
                    self.metrics.inc_read_errors();
                    error!(error = %err, "nft list command failed after retries");
                    panic!(
                        "failed to read nftables state for table {}: {err}",
                        self.name
                    );
                }
            }
        }
    }

    async fn attempt_get_hashes_and_rules(
        &self,
    ) -> Result<(HashMap<String, Vec<String>>, HashMap<String, Vec<ListedRule>>), NftError> {
        debug!("Listing chains and rules from the dataplane");
        let chains = self.backend.list_chains().await?;
        let mut hashes = HashMap::new();
        let mut rules_by_chain = HashMap::new();
        for chain in chains {
            let rules = self.backend.list_rules(&chain).await?;
            let chain_hashes: Vec<String> =
                rules.iter().map(|r| self.hash_from_listed_rule(r)).collect();
            hashes.insert(chain.clone(), chain_hashes);
            rules_by_chain.insert(chain, rules);
        }
        Ok((hashes, rules_by_chain))
    }

    /// Extract the fingerprint from a listed rule's comment; rules without
    /// a recognised fingerprint map to the empty string, or to the legacy
    /// sentinel when the cleanup pattern matches.
    fn hash_from_listed_rule(&self, rule: &ListedRule) -> String {
        if let Some(comment) = &rule.comment {
            if let Some(captures) = self.hash_comment_regex.captures(comment) {
                return captures[1].to_string();
            }
        }
        let comment_matches = rule
            .comment
            .as_deref()
            .map(|c| self.legacy_insert_regex.is_match(c))
            .unwrap_or(false);
        if comment_matches || self.legacy_insert_regex.is_match(&rule.expr) {
            return LEGACY_INSERT_HASH.to_string();
        }
        String::new()
    }

    /// Expected fingerprint layout of a whole hook chain: our inserted
    /// hashes, `num_foreign` empty strings, then our appended hashes.  In
    /// append mode the foreign block comes first.  The inserted and
    /// appended hash lists are returned too so callers don't recompute.
    fn expected_hashes_for_insert_append_chain(
        &self,
        chain_name: &str,
        num_foreign: usize,
    ) -> (Vec<String>, Vec<String>, Vec<String>) {
        let inserted_rules = self
            .chain_to_inserted_rules
            .get(chain_name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let appended_rules = self
            .chain_to_appended_rules
            .get(chain_name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let features = self.feature_detector.features();

        let inserted_hashes = if inserted_rules.is_empty() {
            Vec::new()
        } else {
            rule_hashes(chain_name, inserted_rules, &features)
        };
        // The appended role seeds with a decorated chain name so identical
        // rule content at insert and append positions hashes distinctly.
        let appended_hashes = if appended_rules.is_empty() {
            Vec::new()
        } else {
            rule_hashes(&append_seed(chain_name), appended_rules, &features)
        };

        let mut all =
            vec![String::new(); inserted_hashes.len() + appended_hashes.len() + num_foreign];
        let offset = match self.insert_mode {
            InsertMode::Insert => 0,
            InsertMode::Append => num_foreign,
        };
        for (i, hash) in inserted_hashes.iter().enumerate() {
            all[i + offset] = hash.clone();
        }
        let offset = inserted_hashes.len() + num_foreign;
        for (i, hash) in appended_hashes.iter().enumerate() {
            all[i + offset] = hash.clone();
        }
        (all, inserted_hashes, appended_hashes)
    }

    /// Build and commit one transaction covering every dirty chain.
    async fn apply_updates(&mut self) -> Result<(), NftError> {
        let features = self.feature_detector.features();
        let mut tx = self.backend.new_transaction();

        // The table must always exist; it isn't created by default.
        tx.add_table();
        for (chain, chain_type, hook, priority) in kernel_base_chains(&self.name) {
            tx.add_base_chain(BaseChainSpec {
                name: chain.to_string(),
                chain_type: *chain_type,
                hook: *hook,
                priority: *priority,
            });
        }
        // Ops up to here are idempotent declarations; anything beyond them
        // means the transaction does real work.
        let baseline_ops = tx.num_ops();

        // First pass: forward references.  Flushing a chain that is about
        // to be deleted severs its outbound references; adding a missing
        // chain lets other chains jump to it within this transaction.
        for chain_name in &self.dirty_chains {
            if self.desired_state_of_chain(chain_name).is_none() {
                if self.chain_to_dataplane_hashes.contains_key(chain_name) {
                    tx.flush_chain(chain_name);
                }
            } else if !self.chain_to_dataplane_hashes.contains_key(chain_name) {
                tx.add_chain(chain_name);
            }
        }

        // Second pass: rule deltas for fully-owned chains.  Scan against
        // the previous hashes and replace/append/delete per position so
        // unchanged rules keep their counters.
        let mut new_hashes: HashMap<String, Option<Vec<String>>> = HashMap::new();
        for chain_name in &self.dirty_chains {
            let Some(chain) = self.desired_state_of_chain(chain_name) else {
                continue;
            };
            // nft rejects the transaction if a rule references a set that
            // doesn't exist yet.
            for set_name in chain.ip_set_names() {
                tx.add_set(&set_name, "ipv4_addr");
            }

            let previous_hashes = self
                .chain_to_dataplane_hashes
                .get(chain_name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let full_rules = self
                .chain_to_full_rules
                .get(chain_name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let current_hashes = rule_hashes(chain_name, &chain.rules, &features);

            let limit = previous_hashes.len().max(current_hashes.len());
            for i in 0..limit {
                if i < previous_hashes.len() && i < current_hashes.len() {
                    if previous_hashes[i] == current_hashes[i] {
                        continue;
                    }
                    let mut rendered = chain.rules[i].render(
                        chain_name,
                        &self.comment_fragment(&current_hashes[i]),
                        &features,
                    );
                    rendered.handle = Some(full_rules[i].handle);
                    tx.replace_rule(rendered);
                } else if i < previous_hashes.len() {
                    // Previous state was longer; trim from the end.
                    tx.delete_rule(chain_name, full_rules[i].handle);
                } else {
                    tx.add_rule(chain.rules[i].render(
                        chain_name,
                        &self.comment_fragment(&current_hashes[i]),
                        &features,
                    ));
                }
            }
            new_hashes.insert(chain_name.clone(), Some(current_hashes));
        }

        // Third pass: hook chains.  Stage full-rule updates in a copy so a
        // failed transaction leaves the cache untouched.
        let new_chain_to_full_rules = self.chain_to_full_rules.clone();
        for chain_name in &self.dirty_insert_append {
            let previous_hashes = self
                .chain_to_dataplane_hashes
                .get(chain_name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let num_foreign = previous_hashes.iter().filter(|h| h.is_empty()).count();
            let (all_hashes, inserted_hashes, appended_hashes) =
                self.expected_hashes_for_insert_append_chain(chain_name, num_foreign);
            if all_hashes.as_slice() == previous_hashes {
                continue;
            }

            // Out of sync: flush the whole chain and rebuild our rules.
            // This also evicts foreign rules at the hook site; we own the
            // ordering of hook chains.
            tx.flush_chain(chain_name);

            let inserted_rules = self
                .chain_to_inserted_rules
                .get(chain_name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if !inserted_rules.is_empty() {
                match self.insert_mode {
                    InsertMode::Insert => {
                        debug!(chain = %chain_name, "Rendering insert rules");
                        // Each insert lands on top of the chain, so emit in
                        // reverse to end up in forward order.
                        for i in (0..inserted_rules.len()).rev() {
                            tx.insert_rule(inserted_rules[i].render(
                                chain_name,
                                &self.comment_fragment(&inserted_hashes[i]),
                                &features,
                            ));
                        }
                    }
                    InsertMode::Append => {
                        debug!(chain = %chain_name, "Rendering append rules");
                        for (i, rule) in inserted_rules.iter().enumerate() {
                            tx.add_rule(rule.render(
                                chain_name,
                                &self.comment_fragment(&inserted_hashes[i]),
                                &features,
                            ));
                        }
                    }
                }
            }

            let appended_rules = self
                .chain_to_appended_rules
                .get(chain_name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for (i, rule) in appended_rules.iter().enumerate() {
                tx.add_rule(rule.render(
                    chain_name,
                    &self.comment_fragment(&appended_hashes[i]),
                    &features,
                ));
            }

            new_hashes.insert(chain_name.clone(), Some(all_hashes));
        }

        // Deletions last: the modify passes above removed any references to
        // these chains, and the first pass flushed their own rules.
        for chain_name in &self.dirty_chains {
            if self.desired_state_of_chain(chain_name).is_none()
                && self.chain_to_dataplane_hashes.contains_key(chain_name)
            {
                tx.delete_chain(chain_name);
                new_hashes.insert(chain_name.clone(), None);
            }
        }

        let mut wrote = false;
        if tx.num_ops() == baseline_ops {
            debug!("Update ended up being no-op, skipping call to nftables");
        } else {
            let op = format!("update-{}-v{}", self.name, self.ip_version);
            self.op_recorder.record(&op);
            self.metrics.inc_write_calls();
            let start = self.clock.now();
            let result = self.backend.run(&tx).await;
            let write_duration = self.clock.now() - start;
            self.peak_write_time = self.peak_write_time * 99 / 100;
            if write_duration > self.peak_write_time {
                self.peak_write_time = write_duration;
            }
            if let Err(err) = result {
                self.metrics.inc_write_errors();
                error!(tx = %tx.render(), error = %err, "Failed to run nft transaction");
                return Err(err);
            }
            self.metrics.add_lines_executed(tx.num_ops() as u64);
            self.last_write_time = self.clock.now();
            self.post_write_interval = self.initial_post_write_interval;
            wrote = true;
        }

        if !self.post_write_interval.is_zero() {
            // Never schedule a recheck sooner than nft can plausibly answer.
            let dynamic_min = (self.peak_read_time + self.peak_write_time) * 2;
            if self.post_write_interval < dynamic_min {
                debug!(
                    dynamic_min = ?dynamic_min,
                    "Raising post-write interval to cover nft round-trip time"
                );
                self.post_write_interval = dynamic_min;
            }
        }

        // The transaction covered every dirty chain, including the ones
        // that turned out to be no-op updates.
        self.dirty_chains.clear();
        self.dirty_insert_append.clear();

        for (chain_name, hashes) in new_hashes {
            match hashes {
                Some(hashes) => {
                    self.chain_to_dataplane_hashes.insert(chain_name, hashes);
                }
                None => {
                    self.chain_to_dataplane_hashes.remove(&chain_name);
                }
            }
        }
        self.chain_to_full_rules = new_chain_to_full_rules;

        if wrote {
            // Replace and delete operate on rule handles, which only the
            // kernel assigns; re-read so the next delta has them.
            debug!("Reloading dataplane state after successful write");
            self.load_dataplane_state().await;
        }

        Ok(())
    }

    /// Best-effort dump of the kernel's view, logged before we give up.
    async fn dump_diagnostics(&self) {
        let Some(program) = self.exec.look_path("nft") else {
            error!("nft binary not found while dumping diagnostics");
            return;
        };
        let args: Vec<String> = vec![
            "list".to_string(),
            "table".to_string(),
            self.family.to_string(),
            self.name.clone(),
        ];
        match self.exec.run_command(&program, &args, None).await {
            Ok(output) => error!(state = %output.stdout, "Current state of nftables"),
            Err(err) => error!(error = %err, "Failed to load nftables state"),
        }
    }
}

#[async_trait]
impl ReconcilerTable for Table {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip_version(&self) -> u8 {
        self.ip_version
    }

    fn insert_or_append_rules(&mut self, chain_name: &str, rules: Vec<Rule>) {
        Table::insert_or_append_rules(self, chain_name, rules);
    }

    fn append_rules(&mut self, chain_name: &str, rules: Vec<Rule>) {
        Table::append_rules(self, chain_name, rules);
    }

    fn update_chain(&mut self, chain: Chain) {
        Table::update_chain(self, chain);
    }

    fn update_chains(&mut self, chains: Vec<Chain>) {
        Table::update_chains(self, chains);
    }

    fn remove_chain_by_name(&mut self, name: &str) {
        Table::remove_chain_by_name(self, name);
    }

    fn remove_chains(&mut self, chains: &[Chain]) {
        Table::remove_chains(self, chains);
    }

    fn invalidate_dataplane_cache(&mut self, reason: &'static str) {
        Table::invalidate_dataplane_cache(self, reason);
    }

    async fn apply(&mut self) -> Duration {
        Table::apply(self).await
    }
}
