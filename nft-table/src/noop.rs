//! The table interface shared by the real reconciler and the disabled-host
//! variant.

use std::time::Duration;

use async_trait::async_trait;

use crate::rule::{Chain, Rule};

/// The caller-facing contract: declare desired state, then drive `apply`
/// from the owning event loop.  All methods must be called from one thread.
#[async_trait]
pub trait ReconcilerTable: Send {
    fn name(&self) -> &str;
    fn ip_version(&self) -> u8;
    fn insert_or_append_rules(&mut self, chain_name: &str, rules: Vec<Rule>);
    fn append_rules(&mut self, chain_name: &str, rules: Vec<Rule>);
    fn update_chain(&mut self, chain: Chain);
    fn update_chains(&mut self, chains: Vec<Chain>);
    fn remove_chain_by_name(&mut self, name: &str);
    fn remove_chains(&mut self, chains: &[Chain]);
    fn invalidate_dataplane_cache(&mut self, reason: &'static str);

    /// Reconcile the kernel with the cached desired state.  Returns a hint
    /// for when the caller should invoke `apply` again.
    async fn apply(&mut self) -> Duration;
}

/// Pass-through implementation for hosts where this subsystem is disabled.
/// Accepts every mutation and does nothing.
pub struct NoopTable;

impl NoopTable {
    pub fn new() -> NoopTable {
        NoopTable
    }
}

impl Default for NoopTable {
    fn default() -> Self {
        NoopTable::new()
    }
}

#[async_trait]
impl ReconcilerTable for NoopTable {
    fn name(&self) -> &str {
        ""
    }

    fn ip_version(&self) -> u8 {
        0
    }

    fn insert_or_append_rules(&mut self, _chain_name: &str, _rules: Vec<Rule>) {}

    fn append_rules(&mut self, _chain_name: &str, _rules: Vec<Rule>) {}

    fn update_chain(&mut self, _chain: Chain) {}

    fn update_chains(&mut self, _chains: Vec<Chain>) {}

    fn remove_chain_by_name(&mut self, _name: &str) {}

    fn remove_chains(&mut self, _chains: &[Chain]) {}

    fn invalidate_dataplane_cache(&mut self, _reason: &'static str) {}

    async fn apply(&mut self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Action, Match};

    #[tokio::test]
    async fn test_noop_swallows_everything() {
        let mut table = NoopTable::new();
        table.update_chain(Chain::new(
            "flt-x",
            vec![Rule::new(Match::new(), Action::Allow)],
        ));
        table.insert_or_append_rules("FORWARD", vec![]);
        table.remove_chain_by_name("flt-x");
        table.invalidate_dataplane_cache("test");
        assert_eq!(table.apply().await, Duration::ZERO);
        assert_eq!(table.name(), "");
        assert_eq!(table.ip_version(), 0);
    }
}
