//! Content hashing for sync operations.
//!
//! SHA256 fingerprints give each batch a stable identifier derived from
//! the operations it carries, so a retried batch can be recognized by the
//! remote and in logs.

use sha2::{Digest, Sha256};

/// Batch identifier: SHA256 over the claimed operation ids, in order.
#[must_use]
pub fn batch_id<S: AsRef<str>>(operation_ids: &[S]) -> String {
    let mut hasher = Sha256::new();
    for id in operation_ids {
        hasher.update(id.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_deterministic() {
        let ids = ["op_1", "op_2"];
        assert_eq!(batch_id(&ids), batch_id(&ids));
        assert_eq!(batch_id(&ids).len(), 64);
    }

    #[test]
    fn test_batch_id_depends_on_order_and_boundaries() {
        assert_ne!(batch_id(&["op_1", "op_2"]), batch_id(&["op_2", "op_1"]));
        assert_ne!(batch_id(&["ab", "c"]), batch_id(&["a", "bc"]));
    }
}
