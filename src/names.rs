//! Deterministic replacement naming
//!
//! Every object synthesized for an upgrade run carries the run's suffix
//! `.upgrade.<id>`. The derivation is a pure function of the original name
//! and the upgrade id, so retries and resumed runs always land on the same
//! replacement names.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of a DNS-1123 subdomain, the bound on object names.
pub const MAX_DNS_SUBDOMAIN_LEN: usize = 253;

static UPGRADE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.upgrade\.[0-9]+$").expect("static regex"));

static UPGRADE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("static regex"));

/// The name suffix marking objects that belong to the given upgrade run.
pub fn upgrade_suffix(upgrade_id: &str) -> String {
    format!(".upgrade.{}", upgrade_id)
}

/// Whether the string is a well-formed upgrade id (non-empty, digits only).
pub fn is_valid_upgrade_id(upgrade_id: &str) -> bool {
    UPGRADE_ID_RE.is_match(upgrade_id)
}

/// Derive the replacement name for `original` under the given upgrade id.
///
/// Any existing `.upgrade.<digits>` tail is stripped first, so replacing a
/// replacement compresses back to the original root. If the root plus suffix
/// would exceed [`MAX_DNS_SUBDOMAIN_LEN`], the root is truncated from the
/// right until the concatenation fits. The function is idempotent:
/// `replacement_name(replacement_name(n, id), id) == replacement_name(n, id)`.
pub fn replacement_name(original: &str, upgrade_id: &str) -> String {
    let suffix = upgrade_suffix(upgrade_id);

    let mut root = original;
    // Stripped repeatedly so a replacement of a replacement compresses back
    // to the original root.
    while let Some(m) = UPGRADE_SUFFIX_RE.find(root) {
        root = &root[..m.start()];
    }

    let excess = (root.len() + suffix.len()).saturating_sub(MAX_DNS_SUBDOMAIN_LEN);
    if excess > 0 {
        root = &root[..root.len() - excess];
    }

    format!("{}{}", root, suffix)
}
