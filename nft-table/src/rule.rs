//! Rule and chain value types.
//!
//! A [`Rule`] is an immutable (match, action, comments) triple.  Match
//! criteria and actions render to opaque nftables text fragments; the
//! reconciler itself never interprets them.  Actions that jump or goto
//! another chain expose the target name so the reconciler can track chain
//! reachability.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::features::Features;

/// Chain names longer than this are rejected by the kernel-facing layers of
/// the policy renderer.
pub const MAX_CHAIN_NAME_LENGTH: usize = 28;

const MAX_COMMENT_LEN: usize = 256;

/// Match criteria: an ordered list of nftables match clauses plus the names
/// of any named sets the clauses reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    clauses: Vec<String>,
    set_names: Vec<String>,
}

impl Match {
    pub fn new() -> Match {
        Match::default()
    }

    pub fn protocol(mut self, proto: &str) -> Match {
        self.clauses.push(format!("meta l4proto {proto}"));
        self
    }

    pub fn in_interface(mut self, iface: &str) -> Match {
        self.clauses.push(format!("iifname \"{iface}\""));
        self
    }

    pub fn out_interface(mut self, iface: &str) -> Match {
        self.clauses.push(format!("oifname \"{iface}\""));
        self
    }

    pub fn source_net(mut self, cidr: &str) -> Match {
        self.clauses.push(format!("ip saddr {cidr}"));
        self
    }

    pub fn dest_net(mut self, cidr: &str) -> Match {
        self.clauses.push(format!("ip daddr {cidr}"));
        self
    }

    pub fn dest_port(mut self, proto: &str, port: u16) -> Match {
        self.clauses.push(format!("{proto} dport {port}"));
        self
    }

    /// Match the source address against a named set.  The set name is
    /// recorded so the reconciler can forward-declare it.
    pub fn source_ip_set(mut self, set_name: &str) -> Match {
        self.clauses.push(format!("ip saddr @{set_name}"));
        self.set_names.push(set_name.to_string());
        self
    }

    /// Match the destination address against a named set.
    pub fn dest_ip_set(mut self, set_name: &str) -> Match {
        self.clauses.push(format!("ip daddr @{set_name}"));
        self.set_names.push(set_name.to_string());
        self
    }

    pub fn mark_matches_with_mask(mut self, mark: u32, mask: u32) -> Match {
        self.clauses
            .push(format!("meta mark and {mask:#x} == {mark:#x}"));
        self
    }

    pub fn conntrack_state(mut self, states: &str) -> Match {
        self.clauses.push(format!("ct state {states}"));
        self
    }

    /// Escape hatch for criteria the builder has no method for.
    pub fn raw(mut self, fragment: &str) -> Match {
        self.clauses.push(fragment.to_string());
        self
    }

    pub fn render(&self) -> String {
        self.clauses.join(" ")
    }

    pub fn ip_set_names(&self) -> &[String] {
        &self.set_names
    }
}

/// Verdict of a rule.  `Jump` and `Goto` are the referrer variants: they
/// name another chain and keep it alive in the refcount graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Allow,
    Deny,
    Return,
    Counter,
    Jump { target: String },
    Goto { target: String },
    Masq,
    Snat { to: String },
    Log { prefix: String },
    SetMark { mark: u32, mask: u32 },
    Raw { fragment: String },
}

impl Action {
    pub fn jump(target: &str) -> Action {
        Action::Jump {
            target: target.to_string(),
        }
    }

    pub fn goto(target: &str) -> Action {
        Action::Goto {
            target: target.to_string(),
        }
    }

    /// The chain this action transfers control to, if any.
    pub fn referenced_chain(&self) -> Option<&str> {
        match self {
            Action::Jump { target } | Action::Goto { target } => Some(target),
            _ => None,
        }
    }

    pub fn to_fragment(&self, features: &Features) -> String {
        match self {
            Action::Allow => "accept".to_string(),
            Action::Deny => "drop".to_string(),
            Action::Return => "return".to_string(),
            Action::Counter => "counter".to_string(),
            Action::Jump { target } => format!("jump {target}"),
            Action::Goto { target } => format!("goto {target}"),
            Action::Masq => {
                if features.fully_random_snat {
                    "masquerade fully-random".to_string()
                } else {
                    "masquerade".to_string()
                }
            }
            Action::Snat { to } => {
                if features.fully_random_snat {
                    format!("snat to {to} fully-random")
                } else {
                    format!("snat to {to}")
                }
            }
            Action::Log { prefix } => format!("log prefix \"{prefix}\""),
            // New mark = (old mark & ~mask) ^ value.
            Action::SetMark { mark, mask } => format!(
                "meta mark set meta mark and {:#x} xor {:#x}",
                !mask, mark
            ),
            Action::Raw { fragment } => fragment.clone(),
        }
    }
}

/// One rule: match criteria, an optional action, and free-form comment
/// lines that travel into the kernel alongside the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub match_criteria: Match,
    pub action: Option<Action>,
    pub comments: Vec<String>,
}

impl Rule {
    pub fn new(match_criteria: Match, action: Action) -> Rule {
        Rule {
            match_criteria,
            action: Some(action),
            comments: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: &str) -> Rule {
        self.comments.push(comment.to_string());
        self
    }

    /// Render into a driver rule.  `hash_comment` is the fingerprint
    /// fragment (`prefix ∥ hash`) or empty for unstamped rules.
    pub fn render(&self, chain: &str, hash_comment: &str, features: &Features) -> nft_driver::Rule {
        nft_driver::Rule {
            chain: chain.to_string(),
            rule: self.render_fragment("", features),
            comment: self.render_comment(hash_comment),
            handle: None,
        }
    }

    /// The rule body, with an optional leading marker fragment.  Used both
    /// for kernel submission (no marker) and for fingerprinting (marker in
    /// place of the comment, so the hash covers the rule's full shape).
    pub(crate) fn render_fragment(&self, marker: &str, features: &Features) -> String {
        let mut fragments: Vec<String> = Vec::with_capacity(3);
        if !marker.is_empty() {
            fragments.push(marker.to_string());
        }
        let match_fragment = self.match_criteria.render();
        if !match_fragment.is_empty() {
            fragments.push(match_fragment);
        }
        if let Some(action) = &self.action {
            let action_fragment = action.to_fragment(features);
            if !action_fragment.is_empty() {
                fragments.push(action_fragment);
            }
        }
        if fragments.is_empty() {
            // nft rejects a rule with no statements; a bare counter is the
            // conventional stand-in.
            return "counter".to_string();
        }
        fragments.join(" ")
    }

    fn render_comment(&self, hash_comment: &str) -> Option<String> {
        let mut out = String::new();
        if !hash_comment.is_empty() {
            out.push_str(hash_comment);
        }
        for comment in &self.comments {
            let cleaned = truncate_comment(&escape_comment(comment));
            if !out.is_empty() {
                out.push_str("; ");
            }
            out.push_str(&cleaned);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Replace anything outside the comment-safe character set with an
/// underscore.  Lossy, but the surviving set round-trips through nft and
/// the shell without quoting trouble.
fn escape_comment(s: &str) -> String {
    static SHELL_UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = SHELL_UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9 @%+=:,./-]").unwrap());
    re.replace_all(s, "_").into_owned()
}

fn truncate_comment(s: &str) -> String {
    if s.len() <= MAX_COMMENT_LEN {
        return s.to_string();
    }
    let mut end = MAX_COMMENT_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// A named, ordered list of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: &str, rules: Vec<Rule>) -> Chain {
        Chain {
            name: name.to_string(),
            rules,
        }
    }

    /// Names of every set referenced by any rule in the chain.
    pub fn ip_set_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for rule in &self.rules {
            names.extend(rule.match_criteria.ip_set_names().iter().cloned());
        }
        names
    }
}
