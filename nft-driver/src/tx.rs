//! Transaction model: an ordered batch of nftables operations and its
//! rendering into an `nft -f` script.  One script equals one atomic kernel
//! transaction.

use std::fmt::Write as _;

use crate::Family;

/// A rule as submitted in a transaction.  `rule` is the opaque body text;
/// `comment` travels in the rule's comment slot; `handle` is required for
/// replace operations and ignored otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: String,
    pub rule: String,
    pub comment: Option<String>,
    pub handle: Option<u64>,
}

/// Chain types a base chain can be registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Filter,
    Nat,
    Route,
}

impl ChainType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainType::Filter => "filter",
            ChainType::Nat => "nat",
            ChainType::Route => "route",
        }
    }
}

/// Netfilter hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::Prerouting => "prerouting",
            HookPoint::Input => "input",
            HookPoint::Forward => "forward",
            HookPoint::Output => "output",
            HookPoint::Postrouting => "postrouting",
        }
    }
}

/// Declaration of a kernel base chain.  Base chains must name their hook and
/// priority or they never receive traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseChainSpec {
    pub name: String,
    pub chain_type: ChainType,
    pub hook: HookPoint,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    AddTable,
    AddBaseChain(BaseChainSpec),
    AddChain(String),
    AddSet { name: String, set_type: String },
    FlushChain(String),
    DeleteChain(String),
    AddRule(Rule),
    InsertRule(Rule),
    ReplaceRule(Rule),
    DeleteRule { chain: String, handle: u64 },
}

/// An ordered batch of operations against one table.  Operations are
/// rendered in the order they were queued; `nft -f` applies the whole script
/// or none of it.
#[derive(Debug, Clone)]
pub struct Transaction {
    family: Family,
    table: String,
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new(family: Family, table: &str) -> Transaction {
        Transaction {
            family,
            table: table.to_string(),
            ops: Vec::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declare the table.  Idempotent; queued first by convention.
    pub fn add_table(&mut self) {
        self.ops.push(Op::AddTable);
    }

    /// Declare a base chain with its hook attachment.  Idempotent.
    pub fn add_base_chain(&mut self, spec: BaseChainSpec) {
        self.ops.push(Op::AddBaseChain(spec));
    }

    /// Declare a regular (unhooked) chain.  Idempotent.
    pub fn add_chain(&mut self, name: &str) {
        self.ops.push(Op::AddChain(name.to_string()));
    }

    /// Declare a named set.  Idempotent; required before any rule that
    /// references the set or the whole transaction is rejected.
    pub fn add_set(&mut self, name: &str, set_type: &str) {
        self.ops.push(Op::AddSet {
            name: name.to_string(),
            set_type: set_type.to_string(),
        });
    }

    /// Append a rule to the end of its chain.
    pub fn add_rule(&mut self, rule: Rule) {
        self.ops.push(Op::AddRule(rule));
    }

    /// Push a rule onto the top of its chain.
    pub fn insert_rule(&mut self, rule: Rule) {
        self.ops.push(Op::InsertRule(rule));
    }

    /// Replace the rule at `rule.handle` in place.
    ///
    /// Panics if the rule carries no handle; that is a caller bug, not a
    /// runtime condition.
    pub fn replace_rule(&mut self, rule: Rule) {
        if rule.handle.is_none() {
            panic!("replace_rule requires a rule handle (chain {})", rule.chain);
        }
        self.ops.push(Op::ReplaceRule(rule));
    }

    /// Delete the rule with the given handle from the chain.
    pub fn delete_rule(&mut self, chain: &str, handle: u64) {
        self.ops.push(Op::DeleteRule {
            chain: chain.to_string(),
            handle,
        });
    }

    /// Remove every rule from the chain, ours and foreign alike.
    pub fn flush_chain(&mut self, name: &str) {
        self.ops.push(Op::FlushChain(name.to_string()));
    }

    /// Delete the chain itself.  The chain must be empty of inbound
    /// references by the time this op executes.
    pub fn delete_chain(&mut self, name: &str) {
        self.ops.push(Op::DeleteChain(name.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Render the batch as an `nft -f` script.  An empty transaction renders
    /// to the empty string, which callers treat as "skip the kernel call".
    pub fn render(&self) -> String {
        let mut out = String::new();
        let fam = self.family.as_str();
        let table = &self.table;
        for op in &self.ops {
            match op {
                Op::AddTable => {
                    let _ = writeln!(out, "add table {fam} {table}");
                }
                Op::AddBaseChain(spec) => {
                    let _ = writeln!(
                        out,
                        "add chain {fam} {table} {} {{ type {} hook {} priority {} ; policy accept ; }}",
                        spec.name,
                        spec.chain_type.as_str(),
                        spec.hook.as_str(),
                        spec.priority,
                    );
                }
                Op::AddChain(name) => {
                    let _ = writeln!(out, "add chain {fam} {table} {name}");
                }
                Op::AddSet { name, set_type } => {
                    let _ = writeln!(out, "add set {fam} {table} {name} {{ type {set_type} ; }}");
                }
                Op::FlushChain(name) => {
                    let _ = writeln!(out, "flush chain {fam} {table} {name}");
                }
                Op::DeleteChain(name) => {
                    let _ = writeln!(out, "delete chain {fam} {table} {name}");
                }
                Op::AddRule(rule) => {
                    let _ = writeln!(
                        out,
                        "add rule {fam} {table} {} {}{}",
                        rule.chain,
                        rule.rule,
                        comment_suffix(rule),
                    );
                }
                Op::InsertRule(rule) => {
                    let _ = writeln!(
                        out,
                        "insert rule {fam} {table} {} {}{}",
                        rule.chain,
                        rule.rule,
                        comment_suffix(rule),
                    );
                }
                Op::ReplaceRule(rule) => {
                    let _ = writeln!(
                        out,
                        "replace rule {fam} {table} {} handle {} {}{}",
                        rule.chain,
                        rule.handle.unwrap_or(0),
                        rule.rule,
                        comment_suffix(rule),
                    );
                }
                Op::DeleteRule { chain, handle } => {
                    let _ = writeln!(out, "delete rule {fam} {table} {chain} handle {handle}");
                }
            }
        }
        out
    }
}

fn comment_suffix(rule: &Rule) -> String {
    match &rule.comment {
        // Comment text is sanitised upstream; it cannot contain '"'.
        Some(c) => format!(" comment \"{c}\""),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(chain: &str, body: &str, comment: Option<&str>) -> Rule {
        Rule {
            chain: chain.to_string(),
            rule: body.to_string(),
            comment: comment.map(|c| c.to_string()),
            handle: None,
        }
    }

    #[test]
    fn test_empty_transaction_renders_empty() {
        let tx = Transaction::new(Family::Ip, "filter");
        assert!(tx.is_empty());
        assert_eq!(tx.render(), "");
    }

    #[test]
    fn test_render_declarations() {
        let mut tx = Transaction::new(Family::Ip, "filter");
        tx.add_table();
        tx.add_base_chain(BaseChainSpec {
            name: "FORWARD".to_string(),
            chain_type: ChainType::Filter,
            hook: HookPoint::Forward,
            priority: 0,
        });
        tx.add_chain("flt-fw-eth0");
        tx.add_set("allowed-hosts", "ipv4_addr");
        assert_eq!(
            tx.render(),
            "add table ip filter\n\
             add chain ip filter FORWARD { type filter hook forward priority 0 ; policy accept ; }\n\
             add chain ip filter flt-fw-eth0\n\
             add set ip filter allowed-hosts { type ipv4_addr ; }\n"
        );
    }

    #[test]
    fn test_render_rule_ops() {
        let mut tx = Transaction::new(Family::Ip6, "filter");
        tx.add_rule(rule("c", "tcp dport 22 accept", Some("fw:aaaa")));
        tx.insert_rule(rule("c", "drop", None));
        let mut replacement = rule("c", "tcp dport 23 drop", Some("fw:bbbb"));
        replacement.handle = Some(7);
        tx.replace_rule(replacement);
        tx.delete_rule("c", 9);
        tx.flush_chain("FORWARD");
        tx.delete_chain("c");
        assert_eq!(
            tx.render(),
            "add rule ip6 filter c tcp dport 22 accept comment \"fw:aaaa\"\n\
             insert rule ip6 filter c drop\n\
             replace rule ip6 filter c handle 7 tcp dport 23 drop comment \"fw:bbbb\"\n\
             delete rule ip6 filter c handle 9\n\
             flush chain ip6 filter FORWARD\n\
             delete chain ip6 filter c\n"
        );
        assert_eq!(tx.num_ops(), 6);
    }

    #[test]
    #[should_panic(expected = "requires a rule handle")]
    fn test_replace_without_handle_panics() {
        let mut tx = Transaction::new(Family::Ip, "filter");
        tx.replace_rule(rule("c", "accept", None));
    }
}
