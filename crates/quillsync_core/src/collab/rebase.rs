//! Rebasing queued local changes over shared changes that landed first.
//!
//! Queued actions carry absolute indexes into the local tree, which already
//! contains them. When a shared change arrives on a node that still has
//! queued actions, both sides are transformed against each other: the queued
//! actions so they apply after the shared change, and the shared change so it
//! applies to a local tree that already holds the queued actions. Two inserts
//! at the same index put the shared one first; where both sides rewrite the
//! same units in place, the queued action wins since it is written last.

use crate::model::{ArrayChange, FormatPatch, SlotChange};

/// Effect of a change on a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Insert { index: u32, len: u32 },
    Delete { index: u32, count: u32 },
    /// Rewrites `[index, index + count)` without changing the length
    Update { index: u32, count: u32 },
    /// Does not address positions
    Other,
}

pub(crate) trait Rebase: Clone {
    fn shape(&self) -> Shape;

    /// The same change at `index`; ranged changes cover `count` units.
    fn moved(&self, index: u32, count: u32) -> Self;

    /// What is left of this update where `winner` rewrites the same units.
    fn yield_to(&self, winner: &Self) -> Option<Self>;
}

impl Rebase for SlotChange {
    fn shape(&self) -> Shape {
        match self {
            SlotChange::Insert { index, content, .. } => Shape::Insert {
                index: *index,
                len: content.width(),
            },
            SlotChange::Delete { index, count } => Shape::Delete {
                index: *index,
                count: *count,
            },
            SlotChange::Retain { index, count, .. } => Shape::Update {
                index: *index,
                count: *count,
            },
            SlotChange::AttrSet { .. } | SlotChange::AttrDelete { .. } => Shape::Other,
        }
    }

    fn moved(&self, index: u32, count: u32) -> Self {
        match self {
            SlotChange::Insert {
                content, formats, ..
            } => SlotChange::Insert {
                index,
                content: content.clone(),
                formats: formats.clone(),
            },
            SlotChange::Delete { .. } => SlotChange::Delete { index, count },
            SlotChange::Retain { formats, .. } => SlotChange::Retain {
                index,
                count,
                formats: formats.clone(),
            },
            other => other.clone(),
        }
    }

    fn yield_to(&self, winner: &Self) -> Option<Self> {
        let (
            SlotChange::Retain {
                index,
                count,
                formats,
            },
            SlotChange::Retain { formats: taken, .. },
        ) = (self, winner)
        else {
            return Some(self.clone());
        };
        let formats: FormatPatch = formats
            .iter()
            .filter(|(name, _)| !taken.contains_key(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        (!formats.is_empty()).then(|| SlotChange::Retain {
            index: *index,
            count: *count,
            formats,
        })
    }
}

impl Rebase for ArrayChange {
    fn shape(&self) -> Shape {
        match self {
            ArrayChange::Insert { index, values } => Shape::Insert {
                index: *index,
                len: values.len() as u32,
            },
            ArrayChange::Delete { index, count } => Shape::Delete {
                index: *index,
                count: *count,
            },
            ArrayChange::SetIndex { index, .. } => Shape::Update {
                index: *index,
                count: 1,
            },
        }
    }

    fn moved(&self, index: u32, count: u32) -> Self {
        match self {
            ArrayChange::Insert { values, .. } => ArrayChange::Insert {
                index,
                values: values.clone(),
            },
            ArrayChange::Delete { .. } => ArrayChange::Delete { index, count },
            ArrayChange::SetIndex { value, .. } => ArrayChange::SetIndex {
                index,
                value: value.clone(),
            },
        }
    }

    fn yield_to(&self, _winner: &Self) -> Option<Self> {
        None
    }
}

/// Transform `local` (already applied locally) and `remote` (already applied
/// to the shared node), both made against the same base.
///
/// Returns `local` rebased to apply after `remote`, and `remote` rebased to
/// apply after `local`.
pub(crate) fn transform<T: Rebase>(local: Vec<T>, remote: Vec<T>) -> (Vec<T>, Vec<T>) {
    if local.is_empty() || remote.is_empty() {
        return (local, remote);
    }
    if local.len() > 1 {
        let mut head = local;
        let tail = head.split_off(1);
        let (head, remote) = transform(head, remote);
        let (tail, remote) = transform(tail, remote);
        return (head.into_iter().chain(tail).collect(), remote);
    }
    if remote.len() > 1 {
        let mut head = remote;
        let tail = head.split_off(1);
        let (local, head) = transform(local, head);
        let (local, tail) = transform(local, tail);
        return (local, head.into_iter().chain(tail).collect());
    }
    match (local.into_iter().next(), remote.into_iter().next()) {
        (Some(local), Some(remote)) => transform_pair(local, remote),
        (local, remote) => (local.into_iter().collect(), remote.into_iter().collect()),
    }
}

fn transform_pair<T: Rebase>(local: T, remote: T) -> (Vec<T>, Vec<T>) {
    use Shape::*;

    match (local.shape(), remote.shape()) {
        (Other, _) | (_, Other) => (vec![local], vec![remote]),

        (Insert { index: li, len: ln }, Insert { index: ri, len: rn }) => {
            if li < ri {
                (vec![local], vec![remote.moved(ri + ln, rn)])
            } else {
                (vec![local.moved(li + rn, ln)], vec![remote])
            }
        }
        (Insert { index: li, len: ln }, Delete { index: ri, count: rc }) => (
            vec![local.moved(index_after_delete(li, ri, rc), ln)],
            split_around(&remote, ri, rc, li, ln, true),
        ),
        (Insert { index: li, len: ln }, Update { index: ri, count: rc }) => {
            (vec![local], split_around(&remote, ri, rc, li, ln, false))
        }

        (Delete { index: li, count: lc }, Insert { index: ri, len: rn }) => (
            split_around(&local, li, lc, ri, rn, true),
            vec![remote.moved(index_after_delete(ri, li, lc), rn)],
        ),
        (Delete { index: li, count: lc }, Delete { index: ri, count: rc }) => (
            range_after_delete(&local, li, lc, ri, rc),
            range_after_delete(&remote, ri, rc, li, lc),
        ),
        (Delete { index: li, count: lc }, Update { index: ri, count: rc }) => {
            (vec![local], range_after_delete(&remote, ri, rc, li, lc))
        }

        (Update { index: li, count: lc }, Insert { index: ri, len: rn }) => {
            (split_around(&local, li, lc, ri, rn, false), vec![remote])
        }
        (Update { index: li, count: lc }, Delete { index: ri, count: rc }) => {
            (range_after_delete(&local, li, lc, ri, rc), vec![remote])
        }
        (Update { index: li, count: lc }, Update { index: ri, count: rc }) => {
            let start = li.max(ri);
            let end = (li + lc).min(ri + rc);
            if start >= end {
                return (vec![local], vec![remote]);
            }
            let mut pieces = Vec::new();
            if ri < start {
                pieces.push(remote.moved(ri, start - ri));
            }
            if let Some(rest) = remote.yield_to(&local) {
                pieces.push(rest.moved(start, end - start));
            }
            if end < ri + rc {
                pieces.push(remote.moved(end, ri + rc - end));
            }
            (vec![local], pieces)
        }
    }
}

/// Where `index` lands once `[start, start + count)` is deleted.
fn index_after_delete(index: u32, start: u32, count: u32) -> u32 {
    if index <= start {
        index
    } else if index >= start + count {
        index - count
    } else {
        start
    }
}

/// The ranged `op` over `[start, start + count)` once `width` units are
/// inserted at `at`. A delete that straddles the insertion is split into two
/// sequential deletes; an update is split into the two pieces around it.
fn split_around<T: Rebase>(
    op: &T,
    start: u32,
    count: u32,
    at: u32,
    width: u32,
    deletes: bool,
) -> Vec<T> {
    let end = start + count;
    if at <= start {
        vec![op.moved(start + width, count)]
    } else if at >= end {
        vec![op.moved(start, count)]
    } else if deletes {
        vec![op.moved(start, at - start), op.moved(start + width, end - at)]
    } else {
        vec![op.moved(start, at - start), op.moved(at + width, end - at)]
    }
}

/// The ranged `op` over `[start, start + count)` once `[del, del + del_count)`
/// is deleted. Empty when nothing of the range survives.
fn range_after_delete<T: Rebase>(
    op: &T,
    start: u32,
    count: u32,
    del: u32,
    del_count: u32,
) -> Vec<T> {
    let end = start + count;
    let del_end = del + del_count;
    let overlap = end.min(del_end).saturating_sub(start.max(del));
    let before = del_end.min(start).saturating_sub(del);
    let remaining = count - overlap;
    if remaining == 0 {
        return Vec::new();
    }
    vec![op.moved(start - before, remaining)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FormatMap, SlotContent};
    use serde_json::json;

    fn insert(index: u32, text: &str) -> SlotChange {
        SlotChange::Insert {
            index,
            content: SlotContent::Text(text.to_string()),
            formats: FormatMap::new(),
        }
    }

    fn delete(index: u32, count: u32) -> SlotChange {
        SlotChange::Delete { index, count }
    }

    fn apply(text: &str, changes: &[SlotChange]) -> String {
        let mut chars: Vec<char> = text.chars().collect();
        for change in changes {
            match change {
                SlotChange::Insert {
                    index,
                    content: SlotContent::Text(inserted),
                    ..
                } => {
                    let at = *index as usize;
                    chars.splice(at..at, inserted.chars());
                }
                SlotChange::Delete { index, count } => {
                    let at = *index as usize;
                    chars.drain(at..at + *count as usize);
                }
                _ => {}
            }
        }
        chars.into_iter().collect()
    }

    fn assert_converges(base: &str, local: Vec<SlotChange>, remote: Vec<SlotChange>) -> String {
        let local_first = apply(base, &local);
        let remote_first = apply(base, &remote);
        let (local_after, remote_after) = transform(local, remote);

        let shared = apply(&remote_first, &local_after);
        let replayed = apply(&local_first, &remote_after);
        assert_eq!(shared, replayed);
        shared
    }

    #[test]
    fn test_remote_insert_before_queued_insert() {
        let result = assert_converges("abc", vec![insert(3, "X")], vec![insert(0, "123")]);
        assert_eq!(result, "123abcX");
    }

    #[test]
    fn test_remote_insert_after_queued_insert() {
        let result = assert_converges("abc", vec![insert(1, "X")], vec![insert(3, "Z")]);
        assert_eq!(result, "aXbcZ");
    }

    #[test]
    fn test_tied_inserts_put_remote_first() {
        let result = assert_converges("ab", vec![insert(1, "L")], vec![insert(1, "R")]);
        assert_eq!(result, "aRLb");
    }

    #[test]
    fn test_queued_insert_inside_remote_delete() {
        let result = assert_converges("abcdef", vec![insert(3, "X")], vec![delete(1, 4)]);
        assert_eq!(result, "aXf");
    }

    #[test]
    fn test_remote_insert_inside_queued_delete() {
        let result = assert_converges("abcdef", vec![delete(1, 4)], vec![insert(3, "X")]);
        assert_eq!(result, "aXf");
    }

    #[test]
    fn test_overlapping_deletes() {
        let result = assert_converges("abcdef", vec![delete(1, 3)], vec![delete(2, 3)]);
        assert_eq!(result, "af");
    }

    #[test]
    fn test_sequences_on_both_sides() {
        let result = assert_converges(
            "hello world",
            vec![insert(5, ","), delete(0, 1), insert(0, "H")],
            vec![delete(6, 5), insert(6, "there")],
        );
        assert_eq!(result, "Hello, there");
    }

    #[test]
    fn test_every_insert_delete_pair_converges() {
        let base = "abcdef";
        for at in 0..=6 {
            for start in 0..6 {
                for count in 1..=(6 - start) {
                    assert_converges(base, vec![insert(at, "XY")], vec![delete(start, count)]);
                    assert_converges(base, vec![delete(start, count)], vec![insert(at, "XY")]);
                }
            }
        }
    }

    #[test]
    fn test_format_conflict_keeps_queued_value() {
        let bold = |value| {
            let mut formats = FormatPatch::new();
            formats.insert("bold".to_string(), Some(json!(value)));
            formats
        };
        let local = SlotChange::Retain {
            index: 0,
            count: 4,
            formats: bold(true),
        };
        let remote = SlotChange::Retain {
            index: 2,
            count: 4,
            formats: bold(false),
        };
        let (_, remote) = transform(vec![local], vec![remote]);

        assert_eq!(remote.len(), 1);
        assert!(matches!(
            remote[0],
            SlotChange::Retain {
                index: 4,
                count: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_array_set_yields_to_queued_set() {
        use crate::model::LocalValue;
        let local = ArrayChange::SetIndex {
            index: 1,
            value: LocalValue::from(json!("local")),
        };
        let remote = ArrayChange::SetIndex {
            index: 1,
            value: LocalValue::from(json!("remote")),
        };
        let (local, remote) = transform(vec![local], vec![remote]);

        assert_eq!(local.len(), 1);
        assert!(remote.is_empty());
    }
}
