//! nft-table - dataplane reconciler for an nftables-backed packet filter
//!
//! Maintains a single named nftables table as a faithful projection of an
//! in-memory desired state, surviving concurrent mutation by unrelated
//! processes:
//! - Callers declare whole chains and hook-rule lists; the [`Table`] works
//!   out the minimal transaction on `apply`.
//! - Our rules are identified by a fingerprint in their comment, so drift
//!   detection never parses rule bodies.
//! - Chains are reference-counted from the kernel hook chains; unreachable
//!   chains are never programmed and get deleted when orphaned.
//!
//! The kernel is driven through the `nft-driver` crate; tests substitute an
//! in-memory backend.

pub mod features;
pub mod hash;
pub mod metrics;
pub mod noop;
pub mod rule;
pub mod shim;
pub mod table;

pub use features::{FeatureDetector, Features, StaticFeatures};
pub use hash::{rule_hashes, HASH_LENGTH};
pub use metrics::{MetricsSnapshot, TableMetrics};
pub use noop::{NoopTable, ReconcilerTable};
pub use rule::{Action, Chain, Match, Rule, MAX_CHAIN_NAME_LENGTH};
pub use shim::{Clock, NoopRecorder, OpRecorder, SystemClock};
pub use table::{InsertMode, Table, TableOptions};
