//! `NftCli`: the real backend.  Submits transactions by piping the rendered
//! script to `nft -f -` and reads state back with `nft --json`, parsing only
//! the fields the reconciler cares about (chain names, rule comments and
//! handles).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::tx::Transaction;
use crate::{CmdRunner, Family, NftBackend, NftError};

/// A rule as read back from the kernel.  `expr` carries the raw JSON of the
/// expression list; the reconciler only pattern-matches it for legacy
/// cleanup, never interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRule {
    pub handle: u64,
    pub comment: Option<String>,
    pub expr: String,
}

// Lenient mirrors of the `nft --json` ruleset output.  Every listing is a
// flat array of single-key objects; unknown keys are skipped.

#[derive(Debug, Deserialize)]
struct JsonRuleset {
    #[serde(default)]
    nftables: Vec<JsonEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonEntry {
    chain: Option<JsonChain>,
    rule: Option<JsonRule>,
}

#[derive(Debug, Deserialize)]
struct JsonChain {
    table: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct JsonRule {
    table: String,
    chain: String,
    #[serde(default)]
    handle: u64,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    expr: Option<serde_json::Value>,
}

/// Backend that drives the system `nft` binary.
pub struct NftCli {
    family: Family,
    table: String,
    program: PathBuf,
    runner: Arc<dyn CmdRunner>,
}

impl NftCli {
    /// Resolve the `nft` binary through the runner's PATH lookup.
    pub fn new(family: Family, table: &str, runner: Arc<dyn CmdRunner>) -> Result<NftCli, NftError> {
        let program = runner.look_path("nft").ok_or(NftError::NotFound)?;
        Ok(NftCli {
            family,
            table: table.to_string(),
            program,
            runner,
        })
    }

    async fn nft_json(&self, args: &[&str]) -> Result<JsonRuleset, NftError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.runner.run_command(&self.program, &args, None).await?;
        if !output.success() {
            return Err(NftError::Command {
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }
}

#[async_trait]
impl NftBackend for NftCli {
    fn new_transaction(&self) -> Transaction {
        Transaction::new(self.family, &self.table)
    }

    async fn run(&self, tx: &Transaction) -> Result<(), NftError> {
        let script = tx.render();
        debug!(ops = tx.num_ops(), "Submitting nft transaction");
        let args = vec!["-f".to_string(), "-".to_string()];
        let output = self
            .runner
            .run_command(&self.program, &args, Some(script))
            .await?;
        if !output.success() {
            return Err(NftError::Command {
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn list_chains(&self) -> Result<Vec<String>, NftError> {
        let ruleset = self
            .nft_json(&["--json", "list", "chains", self.family.as_str()])
            .await?;
        let chains = ruleset
            .nftables
            .into_iter()
            .filter_map(|entry| entry.chain)
            .filter(|chain| chain.table == self.table)
            .map(|chain| chain.name)
            .collect();
        Ok(chains)
    }

    async fn list_rules(&self, chain: &str) -> Result<Vec<ListedRule>, NftError> {
        let ruleset = self
            .nft_json(&[
                "--json",
                "-a",
                "list",
                "chain",
                self.family.as_str(),
                &self.table,
                chain,
            ])
            .await?;
        let rules = ruleset
            .nftables
            .into_iter()
            .filter_map(|entry| entry.rule)
            .filter(|rule| rule.table == self.table && rule.chain == chain)
            .map(|rule| ListedRule {
                handle: rule.handle,
                comment: rule.comment,
                expr: rule
                    .expr
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
            })
            .collect();
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAINS_JSON: &str = r#"{
      "nftables": [
        {"metainfo": {"version": "1.0.9", "release_name": "Old Doc Yak", "json_schema_version": 1}},
        {"chain": {"family": "ip", "table": "filter", "name": "FORWARD", "handle": 1, "type": "filter", "hook": "forward", "prio": 0, "policy": "accept"}},
        {"chain": {"family": "ip", "table": "filter", "name": "flt-fw-eth0", "handle": 2}},
        {"chain": {"family": "ip", "table": "other", "name": "not-ours", "handle": 3}}
      ]
    }"#;

    const RULES_JSON: &str = r#"{
      "nftables": [
        {"metainfo": {"version": "1.0.9", "release_name": "Old Doc Yak", "json_schema_version": 1}},
        {"chain": {"family": "ip", "table": "filter", "name": "flt-fw-eth0", "handle": 2}},
        {"rule": {"family": "ip", "table": "filter", "chain": "flt-fw-eth0", "handle": 4,
                  "comment": "fw:AbCdEfGh01234567",
                  "expr": [{"match": {"op": "==", "left": {"payload": {"protocol": "tcp", "field": "dport"}}, "right": 22}}, {"accept": null}]}},
        {"rule": {"family": "ip", "table": "filter", "chain": "flt-fw-eth0", "handle": 5,
                  "expr": [{"counter": {"packets": 0, "bytes": 0}}]}}
      ]
    }"#;

    #[test]
    fn test_parse_chain_listing() {
        let ruleset: JsonRuleset = serde_json::from_str(CHAINS_JSON).unwrap();
        let names: Vec<String> = ruleset
            .nftables
            .into_iter()
            .filter_map(|e| e.chain)
            .filter(|c| c.table == "filter")
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["FORWARD", "flt-fw-eth0"]);
    }

    #[test]
    fn test_parse_rule_listing() {
        let ruleset: JsonRuleset = serde_json::from_str(RULES_JSON).unwrap();
        let rules: Vec<JsonRule> = ruleset.nftables.into_iter().filter_map(|e| e.rule).collect();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].handle, 4);
        assert_eq!(rules[0].comment.as_deref(), Some("fw:AbCdEfGh01234567"));
        assert_eq!(rules[1].handle, 5);
        assert_eq!(rules[1].comment, None);
        // The expression survives as raw JSON for pattern matching.
        let expr = rules[1].expr.as_ref().unwrap().to_string();
        assert!(expr.contains("counter"));
    }
}
