//! Rule fingerprinting.
//!
//! Every rule the reconciler programs carries a short identifier in its
//! comment so our rules can be recognised on read-back without parsing
//! them.  Fingerprints chain: each rule's hash mixes in the previous rule's
//! hash, so a rule's identity depends on its chain, its position, and every
//! rule before it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha224};

use crate::features::Features;
use crate::rule::Rule;

/// 16 base64 characters give 96 bits of the SHA-224 digest: short enough to
/// read in `nft list` output, collision-resistant enough in practice.
pub const HASH_LENGTH: usize = 16;

/// Marker that stands in for the comment slot when hashing, so the hashed
/// text has the same shape as the submitted rule.
const HASH_MARKER: &str = "HASH";

/// Compute the fingerprint of each rule in order.
///
/// The seed is the digest of the chain name, so identical rules in
/// different chains hash differently.  Callers hashing rules for the
/// appended role pass a decorated chain name (see
/// [`append_seed`]) so insert-role and append-role hashes never collide.
pub fn rule_hashes(chain_name: &str, rules: &[Rule], features: &Features) -> Vec<String> {
    let mut hashes = Vec::with_capacity(rules.len());
    let mut hash = Sha224::digest(chain_name.as_bytes());
    for rule in rules {
        let mut hasher = Sha224::new();
        hasher.update(&hash);
        let rule_text = format!(
            "add rule {} {}",
            chain_name,
            rule.render_fragment(HASH_MARKER, features)
        );
        hasher.update(rule_text.as_bytes());
        hash = hasher.finalize();
        let mut encoded = URL_SAFE_NO_PAD.encode(&hash);
        encoded.truncate(HASH_LENGTH);
        hashes.push(encoded);
    }
    hashes
}

/// The decorated chain name used to seed hashes for appended-role rules.
pub fn append_seed(chain_name: &str) -> String {
    format!("{chain_name}*appends*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Action, Match};

    fn rules() -> Vec<Rule> {
        vec![
            Rule::new(Match::new().protocol("tcp"), Action::Allow),
            Rule::new(Match::new().protocol("udp"), Action::Deny),
            Rule::new(Match::new(), Action::jump("flt-next")),
        ]
    }

    #[test]
    fn test_deterministic() {
        let f = Features::default();
        assert_eq!(
            rule_hashes("flt-fw", &rules(), &f),
            rule_hashes("flt-fw", &rules(), &f)
        );
    }

    #[test]
    fn test_shape() {
        let f = Features::default();
        for hash in rule_hashes("flt-fw", &rules(), &f) {
            assert_eq!(hash.len(), HASH_LENGTH);
            assert!(
                hash.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
                "unexpected character in {hash}"
            );
        }
    }

    #[test]
    fn test_position_sensitive() {
        let f = Features::default();
        let mut swapped = rules();
        swapped.swap(0, 1);
        let original = rule_hashes("flt-fw", &rules(), &f);
        let reordered = rule_hashes("flt-fw", &swapped, &f);
        // Both swapped positions change, and the chained rule after them
        // changes too.
        assert_ne!(original[0], reordered[0]);
        assert_ne!(original[1], reordered[1]);
        assert_ne!(original[2], reordered[2]);
    }

    #[test]
    fn test_chain_name_in_seed() {
        let f = Features::default();
        let a = rule_hashes("flt-a", &rules()[..1], &f);
        let b = rule_hashes("flt-b", &rules()[..1], &f);
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn test_append_seed_distinct() {
        let f = Features::default();
        let inserted = rule_hashes("FORWARD", &rules()[..1], &f);
        let appended = rule_hashes(&append_seed("FORWARD"), &rules()[..1], &f);
        assert_ne!(inserted[0], appended[0]);
    }

    #[test]
    fn test_prefix_sensitive() {
        let f = Features::default();
        let two = rule_hashes("flt-fw", &rules()[..2], &f);
        let mut grown = rules()[..2].to_vec();
        grown.insert(0, Rule::new(Match::new(), Action::Counter));
        let three = rule_hashes("flt-fw", &grown, &f);
        // Inserting at the front rekeys everything after it.
        assert_ne!(two[0], three[1]);
        assert_ne!(two[1], three[2]);
    }
}
