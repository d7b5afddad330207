use crate::model::*;

// ── Availability views ────────────────────────────────────────────

/// Bookable slots whose start lies in `[from, to]`, ordered by start.
pub fn bookable_in_window(slots: &[SlotInfo], from: Ms, to: Ms) -> Vec<SlotInfo> {
    let mut hits: Vec<SlotInfo> = slots
        .iter()
        .filter(|s| s.is_available && !s.is_blocked)
        .filter(|s| from <= s.start && s.start <= to)
        .cloned()
        .collect();
    hits.sort_by_key(|s| (s.start, s.id));
    hits
}

/// Contiguous stretches of bookable time built from back-to-back slots.
pub fn open_windows(bookable: &[SlotInfo]) -> Vec<Span> {
    let mut spans: Vec<Span> = bookable.iter().map(|s| Span::new(s.start, s.end)).collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn slot(start: Ms, end: Ms, available: bool, blocked: bool) -> SlotInfo {
        SlotInfo {
            id: Ulid::new(),
            veterinarian_id: Ulid::nil(),
            start,
            end,
            is_available: available,
            is_blocked: blocked,
        }
    }

    #[test]
    fn window_keeps_only_bookable_slots() {
        let slots = vec![
            slot(3 * H, 4 * H, true, false),
            slot(H, 2 * H, true, false),
            slot(2 * H, 3 * H, false, false), // booked
            slot(4 * H, 5 * H, true, true),   // blocked
        ];
        let hits = bookable_in_window(&slots, 0, 10 * H);
        let starts: Vec<Ms> = hits.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![H, 3 * H]);
    }

    #[test]
    fn window_filters_on_start_inclusive() {
        let slots = vec![
            slot(0, H, true, false),
            slot(H, 2 * H, true, false),
            slot(2 * H, 3 * H, true, false),
        ];
        // A slot that starts exactly at `to` is in; one that starts before `from` is out
        // even though it ends inside the window.
        let hits = bookable_in_window(&slots, H / 2, 2 * H);
        let starts: Vec<Ms> = hits.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![H, 2 * H]);
    }

    #[test]
    fn empty_window_yields_nothing() {
        let slots = vec![slot(5 * H, 6 * H, true, false)];
        assert!(bookable_in_window(&slots, 0, 4 * H).is_empty());
    }

    #[test]
    fn open_windows_join_back_to_back_slots() {
        let slots = vec![
            slot(2 * H, 3 * H, true, false),
            slot(H, 2 * H, true, false),
            slot(5 * H, 6 * H, true, false),
        ];
        assert_eq!(
            open_windows(&slots),
            vec![Span::new(H, 3 * H), Span::new(5 * H, 6 * H)]
        );
    }

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(0, 100), Span::new(50, 150), Span::new(200, 300)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(0, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(0, 100), Span::new(100, 200)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 200)]);
    }

    #[test]
    fn merge_overlapping_contained() {
        let spans = vec![Span::new(0, 500), Span::new(100, 200)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 500)]);
    }
}
