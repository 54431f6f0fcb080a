//! Cleanup labels and resource naming.
//!
//! Every engine resource created for a run carries [`CLEANUP_LABEL`] with the
//! run's test identity as its value. The sweeper discovers "everything that
//! belongs to this run" exclusively through that label, so it is attached in
//! the create request itself, never afterwards.

use std::collections::HashMap;

/// Label key whose value is the owning test identity.
pub const CLEANUP_LABEL: &str = "io.clawbernetes.testnet.test-id";

/// Label key naming the node a resource belongs to.
pub const NODE_LABEL: &str = "io.clawbernetes.testnet.node";

/// Label key marking short-lived helper containers.
pub const ROLE_LABEL: &str = "io.clawbernetes.testnet.role";

/// Value of [`ROLE_LABEL`] for helper containers.
pub const HELPER_ROLE: &str = "helper";

/// Maximum length of a DNS label, which bounds container hostnames.
pub const MAX_HOSTNAME_LEN: usize = 63;

/// Labels every resource of a run carries.
#[must_use]
pub fn cleanup_labels(test_id: &str) -> HashMap<String, String> {
    HashMap::from([(CLEANUP_LABEL.to_string(), test_id.to_string())])
}

/// Labels for a resource owned by a specific node.
#[must_use]
pub fn node_labels(test_id: &str, node_name: &str) -> HashMap<String, String> {
    let mut labels = cleanup_labels(test_id);
    labels.insert(NODE_LABEL.to_string(), node_name.to_string());
    labels
}

/// Labels for a helper container working on a node's volume.
#[must_use]
pub fn helper_labels(test_id: &str, node_name: &str) -> HashMap<String, String> {
    let mut labels = node_labels(test_id, node_name);
    labels.insert(ROLE_LABEL.to_string(), HELPER_ROLE.to_string());
    labels
}

/// Engine label filter (`key=value`) selecting a run's resources.
#[must_use]
pub fn cleanup_filter(test_id: &str) -> String {
    format!("{CLEANUP_LABEL}={test_id}")
}

/// Sanitize an arbitrary string into a valid container/volume name fragment.
///
/// Keeps ASCII alphanumerics, `-` and `.`; everything else (including `::`
/// from Rust test paths) collapses into a single `-`. The result is
/// lowercase and never starts or ends with a separator.
#[must_use]
pub fn sanitize_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') || out.ends_with('.') {
        out.pop();
    }
    out
}

/// Condense a name so it fits in a DNS label.
///
/// Names within [`MAX_HOSTNAME_LEN`] are returned as-is; longer ones keep the
/// first 30 and last 32 characters, joined with `-`.
#[must_use]
pub fn condense_hostname(name: &str) -> String {
    if name.len() <= MAX_HOSTNAME_LEN {
        return name.to_string();
    }
    let head: String = name.chars().take(30).collect();
    let tail: String = name
        .chars()
        .skip(name.chars().count().saturating_sub(32))
        .collect();
    format!("{head}-{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("TestNodeSet", "testnodeset" ; "lowercased")]
    #[test_case("nodes::tests::test_restart", "nodes-tests-test-restart" ; "rust test path")]
    #[test_case("a//b  c", "a-b-c" ; "runs collapse")]
    #[test_case("--x--", "x" ; "trimmed")]
    #[test_case("v1.2", "v1.2" ; "dots kept")]
    fn test_sanitize_name(input: &str, expected: &str) {
        assert_eq!(sanitize_name(input), expected);
    }

    #[test]
    fn test_condense_short_hostname_unchanged() {
        assert_eq!(condense_hostname("val-0-mytest"), "val-0-mytest");
    }

    #[test]
    fn test_condense_long_hostname() {
        let long = "x".repeat(40) + &"y".repeat(40);
        let condensed = condense_hostname(&long);
        assert_eq!(condensed.len(), 63);
        assert!(condensed.starts_with(&"x".repeat(30)));
        assert!(condensed.ends_with(&"y".repeat(32)));
    }

    #[test]
    fn test_cleanup_filter_format() {
        assert_eq!(
            cleanup_filter("my-test"),
            "io.clawbernetes.testnet.test-id=my-test"
        );
    }

    #[test]
    fn test_helper_labels_include_run_and_node() {
        let labels = helper_labels("run", "val-0-run");
        assert_eq!(labels.get(CLEANUP_LABEL).map(String::as_str), Some("run"));
        assert_eq!(labels.get(NODE_LABEL).map(String::as_str), Some("val-0-run"));
        assert_eq!(labels.get(ROLE_LABEL).map(String::as_str), Some(HELPER_ROLE));
    }
}
