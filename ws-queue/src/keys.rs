//! Substrate key names

use crate::job::JobKind;

pub const KEY_PREFIX: &str = "ws:";
pub const PROCESSING_LIST: &str = "ws:processing";
pub const RESERVATION_LEASES: &str = "ws:processing:leases";
pub const INFLIGHT_PREFIX: &str = "ws:inflight:";

/// List holding pending jobs of the given kind.
pub fn queue_key(kind: JobKind) -> String {
    format!("{KEY_PREFIX}queue:{}", kind.as_str())
}

/// Single-flight claim guarding a workspace.
pub fn inflight_key(workspace_id: &str) -> String {
    format!("{INFLIGHT_PREFIX}{workspace_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(queue_key(JobKind::Provision), "ws:queue:provision");
        assert_eq!(inflight_key("abc"), "ws:inflight:abc");
    }
}
