//! Extent / reservation math (spec.md §4.5 "Free-space computation", §4.3
//! step 6). Pure geometry over `(start, size)` pairs — no I/O, no handler
//! state — which is why it sits beneath the IMSM codec in the dependency
//! order (spec.md §2).

use crate::mdcore::geometry::RESERVED_SECTORS;
use crate::mdcore::types::Sector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: Sector,
    pub size: Sector,
    pub volume: u16,
}

impl Extent {
    pub fn end(&self) -> Sector {
        self.start + self.size
    }
}

/// Coalesce overlapping extents by keeping the maximum end, as spec.md §4.5
/// describes ("Coalesce overlapping extents by picking the maximum end").
/// Input order is preserved as tie-break for equal starts.
pub fn coalesce(mut extents: Vec<Extent>) -> Vec<Extent> {
    extents.sort_by_key(|e| e.start);
    let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
    for e in extents {
        if let Some(last) = out.last_mut() {
            if e.start <= last.end() {
                if e.end() > last.end() {
                    last.size = e.end() - last.start;
                }
                continue;
            }
        }
        out.push(e);
    }
    out
}

/// Free run following each extent in the coalesced list, after subtracting
/// `RESERVED_SECTORS` on both sides of a volume boundary (spec.md §4.5).
/// The member's total `device_sectors` bounds the final, trailing run.
pub fn free_runs(extents: &[Extent], device_sectors: Sector) -> Vec<(Sector, Sector)> {
    let coalesced = coalesce(extents.to_vec());
    let mut runs = Vec::new();
    let mut cursor = 0;
    for e in &coalesced {
        if e.start > cursor {
            let gap_start = cursor;
            let gap_end = e.start;
            let reserved_start = if cursor == 0 { gap_start } else { gap_start + RESERVED_SECTORS };
            let reserved_end = gap_end.saturating_sub(RESERVED_SECTORS);
            if reserved_end > reserved_start {
                runs.push((reserved_start, reserved_end - reserved_start));
            }
        }
        cursor = e.end();
    }
    if device_sectors > cursor {
        let reserved_start = if cursor == 0 { cursor } else { cursor + RESERVED_SECTORS };
        if device_sectors > reserved_start {
            runs.push((reserved_start, device_sectors - reserved_start));
        }
    }
    runs
}

/// The single largest free run across all members, aligned down to the
/// requested chunk (spec.md §4.5: "The largest free run across *all*
/// members... bounds the achievable grow").
pub fn largest_common_free_run(per_member_extents: &[(Sector, Vec<Extent>)], chunk: Sector) -> Sector {
    let mut best = Sector::MAX;
    for (device_sectors, extents) in per_member_extents {
        let member_best = free_runs(extents, *device_sectors)
            .into_iter()
            .map(|(_, len)| len)
            .max()
            .unwrap_or(0);
        best = best.min(member_best);
    }
    if best == Sector::MAX {
        return 0;
    }
    if chunk == 0 {
        best
    } else {
        (best / chunk) * chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_overlapping_extents() {
        let extents = vec![
            Extent { start: 0, size: 100, volume: 0 },
            Extent { start: 50, size: 200, volume: 1 },
        ];
        let merged = coalesce(extents);
        assert_eq!(merged, vec![Extent { start: 0, size: 250, volume: 0 }]);
    }

    #[test]
    fn free_run_respects_reservation_on_both_sides() {
        let extents = vec![Extent { start: RESERVED_SECTORS, size: 1000, volume: 0 }];
        let runs = free_runs(&extents, RESERVED_SECTORS + 1000 + RESERVED_SECTORS + 5000);
        // one run before (len 0, dropped) and one run after the volume
        assert_eq!(runs.len(), 1);
        let (start, len) = runs[0];
        assert_eq!(start, RESERVED_SECTORS + 1000 + RESERVED_SECTORS);
        assert_eq!(len, 5000);
    }

    #[test]
    fn largest_common_free_run_is_bounded_by_smallest_member() {
        let a = (100_000u64, vec![Extent { start: 0, size: 10_000, volume: 0 }]);
        let b = (50_000u64, vec![Extent { start: 0, size: 10_000, volume: 0 }]);
        let run = largest_common_free_run(&[a, b], 8);
        assert!(run <= 50_000 - 10_000 - RESERVED_SECTORS);
    }

    #[test]
    fn filling_exact_last_extent_leaves_zero_free() {
        let extents = vec![Extent { start: 0, size: 10_000, volume: 0 }];
        let runs = free_runs(&extents, 10_000);
        assert!(runs.is_empty());
    }
}
