//! Assertion helpers over recorded storage operations.

use imms_core::storage::WritePrecondition;

use crate::storage::StorageOp;

/// Counts puts whose path contains `fragment`.
pub fn count_puts(ops: &[StorageOp], fragment: &str) -> usize {
    ops.iter()
        .filter(|op| matches!(op, StorageOp::Put { path, .. } if path.contains(fragment)))
        .count()
}

/// Asserts that nothing was written under `fragment`.
///
/// # Panics
///
/// Panics if any put or delete touched a matching path.
pub fn assert_no_writes(ops: &[StorageOp], fragment: &str) {
    let offending: Vec<&StorageOp> = ops
        .iter()
        .filter(|op| matches!(op, StorageOp::Put { .. } | StorageOp::Delete { .. }))
        .filter(|op| op.path().contains(fragment))
        .collect();
    assert!(
        offending.is_empty(),
        "expected no writes under {fragment}, found {offending:?}"
    );
}

/// Asserts that every put under `fragment` was conditional.
///
/// # Panics
///
/// Panics if an unconditional put touched a matching path.
pub fn assert_all_puts_conditional(ops: &[StorageOp], fragment: &str) {
    for op in ops {
        if let StorageOp::Put {
            path, precondition, ..
        } = op
        {
            if path.contains(fragment) {
                assert_ne!(
                    *precondition,
                    WritePrecondition::None,
                    "unconditional write to {path}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_checks_puts() {
        let ops = vec![
            StorageOp::Put {
                path: "env=t/records/a.json".into(),
                size: 1,
                precondition: WritePrecondition::DoesNotExist,
            },
            StorageOp::Get {
                path: "env=t/ledger/x.json".into(),
            },
        ];
        assert_eq!(count_puts(&ops, "records/"), 1);
        assert_no_writes(&ops, "ledger/");
        assert_all_puts_conditional(&ops, "records/");
    }
}
