//! Boundary handling for boundary-inclusive sources.

use crate::types::{ChangeRecord, Position};

/// Low-water-mark to ask the source for, given the cursor.
///
/// Lowered by one so records sharing the cursor version are fetched again;
/// some of them may not have been delivered yet.
pub fn low_water_mark(cursor: Position) -> u64 {
    cursor.version.saturating_sub(1)
}

/// Keep only records strictly after `cursor`, in ascending composite order.
pub fn strict_successors(candidates: Vec<ChangeRecord>, cursor: Position) -> Vec<ChangeRecord> {
    let mut kept: Vec<ChangeRecord> = candidates
        .into_iter()
        .filter(|r| r.position() > cursor)
        .collect();
    kept.sort_by_key(|r| r.position());
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn positions(records: &[ChangeRecord]) -> Vec<(u64, u64)> {
        records
            .iter()
            .map(|r| (r.order_version, r.entity_id))
            .collect()
    }

    #[test]
    fn test_low_water_mark() {
        assert_eq!(low_water_mark(Position::new(0, 0)), 0);
        assert_eq!(low_water_mark(Position::new(1, 4)), 0);
        assert_eq!(low_water_mark(Position::new(5, 12)), 4);
    }

    #[test]
    fn test_boundary_duplicate_removed() {
        let candidates = vec![
            ChangeRecord::new(5, 12),
            ChangeRecord::new(5, 13),
            ChangeRecord::new(6, 1),
        ];
        let kept = strict_successors(candidates, Position::new(5, 12));
        assert_eq!(positions(&kept), vec![(5, 13), (6, 1)]);
    }

    #[test]
    fn test_older_versions_removed() {
        let candidates = vec![
            ChangeRecord::new(4, 99),
            ChangeRecord::new(5, 3),
            ChangeRecord::new(5, 20),
        ];
        let kept = strict_successors(candidates, Position::new(5, 12));
        assert_eq!(positions(&kept), vec![(5, 20)]);
    }

    #[test]
    fn test_origin_keeps_everything_but_origin() {
        let candidates = vec![ChangeRecord::new(0, 0), ChangeRecord::new(1, 1)];
        let kept = strict_successors(candidates, Position::ORIGIN);
        assert_eq!(positions(&kept), vec![(1, 1)]);
    }

    proptest! {
        #[test]
        fn prop_every_kept_record_is_after_cursor(
            raw in proptest::collection::vec((0u64..20, 0u64..20), 0..50),
            cursor in (0u64..20, 0u64..20),
        ) {
            let cursor = Position::new(cursor.0, cursor.1);
            let candidates: Vec<ChangeRecord> =
                raw.iter().map(|&(v, e)| ChangeRecord::new(v, e)).collect();
            let expected = candidates.iter().filter(|r| r.position() > cursor).count();

            let kept = strict_successors(candidates, cursor);

            prop_assert_eq!(kept.len(), expected);
            prop_assert!(kept.iter().all(|r| r.position() > cursor));
            prop_assert!(kept.windows(2).all(|w| w[0].position() <= w[1].position()));
        }
    }
}
