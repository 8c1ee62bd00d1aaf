use serde::{Deserialize, Serialize};

/// One step of an array edit script. `el_index` and `after_el_index`
/// refer to positions in the *original* array; `after_el_index: None`
/// places the element at the front. The script applies in order: deletes,
/// then moves in target order, then adds in target order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ArrayChange<T> {
    Add {
        element: T,
        after_el_index: Option<usize>,
    },
    MoveLeft {
        el_index: usize,
        after_el_index: Option<usize>,
    },
    MoveRight {
        el_index: usize,
        after_el_index: Option<usize>,
    },
    Delete {
        el_index: usize,
    },
}

/// Per-element fate of the original array, aligned with it by index.
/// `was_touched` marks an element that keeps its place while its
/// immediate context changed; merge uses it to tell edited-adjacent
/// elements from untouched ones.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ElementChange {
    Keep { el_index: usize, was_touched: bool },
    MoveLeft { el_index: usize },
    MoveRight { el_index: usize },
    Delete { el_index: usize },
}

/// Result of [`diff_array`]: the minimal edit script plus the per-element
/// annotation of the source array.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArrayDiff<T> {
    pub changes: Vec<ArrayChange<T>>,
    pub element_changes: Vec<ElementChange>,
}

/// Computes an edit script turning `a` into `b` under the injected
/// equality predicate. `apply_array_diff(a, &diff.changes) == b` holds
/// for every input; equal arrays produce an empty script and all-`Keep`
/// annotations.
pub fn diff_array<T, F>(a: &[T], b: &[T], equals: F) -> ArrayDiff<T>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    // match each b element to the first unmatched equal a element
    let mut a_matched: Vec<Option<usize>> = vec![None; a.len()];
    let mut b_matched: Vec<Option<usize>> = vec![None; b.len()];
    for (j, bv) in b.iter().enumerate() {
        for (i, av) in a.iter().enumerate() {
            if a_matched[i].is_none() && equals(av, bv) {
                a_matched[i] = Some(j);
                b_matched[j] = Some(i);
                break;
            }
        }
    }

    // matched a indices in b order; the longest increasing subsequence
    // keeps its relative order, everything else moves
    let pairs: Vec<(usize, usize)> = b_matched
        .iter()
        .enumerate()
        .filter_map(|(j, i)| i.map(|i| (j, i)))
        .collect();
    let seq: Vec<usize> = pairs.iter().map(|(_, i)| *i).collect();
    let kept = longest_increasing(&seq);
    let kept_set: std::collections::BTreeSet<usize> =
        kept.iter().map(|pos| seq[*pos]).collect();

    let mut changes: Vec<ArrayChange<T>> = Vec::new();

    // deletes of unmatched a elements, ascending
    for (i, m) in a_matched.iter().enumerate() {
        if m.is_none() {
            changes.push(ArrayChange::Delete { el_index: i });
        }
    }

    // ranks among matched elements, by a position and by b position
    let mut a_rank = std::collections::BTreeMap::new();
    {
        let mut sorted: Vec<usize> = seq.clone();
        sorted.sort_unstable();
        for (rank, i) in sorted.into_iter().enumerate() {
            a_rank.insert(i, rank);
        }
    }

    // moves in b order, anchored after the previous matched element
    let mut prev_matched: Option<usize> = None;
    let mut move_dirs: std::collections::BTreeMap<usize, bool> = std::collections::BTreeMap::new();
    for (b_rank, (_, i)) in pairs.iter().enumerate() {
        if !kept_set.contains(i) {
            let left = b_rank < a_rank[i];
            move_dirs.insert(*i, left);
            if left {
                changes.push(ArrayChange::MoveLeft {
                    el_index: *i,
                    after_el_index: prev_matched,
                });
            } else {
                changes.push(ArrayChange::MoveRight {
                    el_index: *i,
                    after_el_index: prev_matched,
                });
            }
        }
        prev_matched = Some(*i);
    }

    // adds in b order, anchored after the previous matched element
    let mut prev_matched: Option<usize> = None;
    for (j, m) in b_matched.iter().enumerate() {
        match m {
            Some(i) => prev_matched = Some(*i),
            None => changes.push(ArrayChange::Add {
                element: b[j].clone(),
                after_el_index: prev_matched,
            }),
        }
    }

    // per-element annotation of a
    let mut element_changes = Vec::with_capacity(a.len());
    for (i, m) in a_matched.iter().enumerate() {
        let fate = match m {
            None => ElementChange::Delete { el_index: i },
            Some(j) => {
                if kept_set.contains(&i) {
                    ElementChange::Keep {
                        el_index: i,
                        was_touched: context_changed(i, *j, a.len(), b.len(), &b_matched),
                    }
                } else if move_dirs[&i] {
                    ElementChange::MoveLeft { el_index: i }
                } else {
                    ElementChange::MoveRight { el_index: i }
                }
            }
        };
        element_changes.push(fate);
    }

    ArrayDiff {
        changes,
        element_changes,
    }
}

/// True when the immediate neighbours of a kept element differ between
/// the two arrays.
fn context_changed(
    i: usize,
    j: usize,
    a_len: usize,
    b_len: usize,
    b_matched: &[Option<usize>],
) -> bool {
    let left_same = match (i, j) {
        (0, 0) => true,
        (0, _) | (_, 0) => false,
        (i, j) => b_matched[j - 1] == Some(i - 1),
    };
    let right_same = if i + 1 == a_len && j + 1 == b_len {
        true
    } else if i + 1 == a_len || j + 1 == b_len {
        false
    } else {
        b_matched[j + 1] == Some(i + 1)
    };
    !(left_same && right_same)
}

/// Applies an edit script produced by [`diff_array`].
pub fn apply_array_diff<T: Clone>(a: &[T], changes: &[ArrayChange<T>]) -> Vec<T> {
    // every entry remembers which original element anchors it, so later
    // steps can address positions through original indices
    struct Entry<T> {
        root: Option<usize>,
        orig: Option<usize>,
        value: T,
    }
    let mut entries: Vec<Entry<T>> = a
        .iter()
        .enumerate()
        .map(|(i, value)| Entry {
            root: Some(i),
            orig: Some(i),
            value: value.clone(),
        })
        .collect();

    let position_after = |entries: &[Entry<T>], root: Option<usize>| -> usize {
        let mut pos = 0;
        for (idx, entry) in entries.iter().enumerate() {
            if entry.root == root {
                pos = idx + 1;
            }
        }
        pos
    };

    for change in changes {
        match change {
            ArrayChange::Delete { el_index } => {
                entries.retain(|entry| entry.orig != Some(*el_index));
            }
            ArrayChange::MoveLeft {
                el_index,
                after_el_index,
            }
            | ArrayChange::MoveRight {
                el_index,
                after_el_index,
            } => {
                let from = entries
                    .iter()
                    .position(|entry| entry.orig == Some(*el_index));
                if let Some(from) = from {
                    let entry = entries.remove(from);
                    let to = position_after(&entries, *after_el_index);
                    entries.insert(to, entry);
                }
            }
            ArrayChange::Add {
                element,
                after_el_index,
            } => {
                let to = position_after(&entries, *after_el_index);
                entries.insert(
                    to,
                    Entry {
                        root: *after_el_index,
                        orig: None,
                        value: element.clone(),
                    },
                );
            }
        }
    }
    entries.into_iter().map(|entry| entry.value).collect()
}

/// Positions (into `seq`) of a longest strictly increasing subsequence,
/// preferring the lexicographically smallest values on ties.
fn longest_increasing(seq: &[usize]) -> Vec<usize> {
    if seq.is_empty() {
        return Vec::new();
    }
    // patience sorting with predecessor links
    let mut tails: Vec<usize> = Vec::new(); // positions of pile tails
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (pos, &value) in seq.iter().enumerate() {
        let pile = tails.partition_point(|&tail| seq[tail] < value);
        if pile > 0 {
            prev[pos] = Some(tails[pile - 1]);
        }
        if pile == tails.len() {
            tails.push(pos);
        } else {
            tails[pile] = pos;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut current = tails.last().copied();
    while let Some(pos) = current {
        out.push(pos);
        current = prev[pos];
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct N {
        n: i32,
    }

    fn ns(values: &[i32]) -> Vec<N> {
        values.iter().map(|&n| N { n }).collect()
    }

    fn eq(a: &N, b: &N) -> bool {
        a == b
    }

    // mixed deletions, moves and insertions in one script
    #[test]
    fn mixed_diff_matches_the_reference_script() {
        let a = ns(&[1, 2, 3]);
        let b = ns(&[4, 3, 5, 2, 6]);
        let diff = diff_array(&a, &b, eq);
        assert_eq!(
            diff.changes,
            vec![
                ArrayChange::Delete { el_index: 0 },
                ArrayChange::MoveLeft {
                    el_index: 2,
                    after_el_index: None
                },
                ArrayChange::Add {
                    element: N { n: 4 },
                    after_el_index: None
                },
                ArrayChange::Add {
                    element: N { n: 5 },
                    after_el_index: Some(2)
                },
                ArrayChange::Add {
                    element: N { n: 6 },
                    after_el_index: Some(1)
                },
            ]
        );
        assert_eq!(apply_array_diff(&a, &diff.changes), b);
    }

    #[test]
    fn equal_arrays_produce_keeps_only() {
        let a = ns(&[1, 2, 3]);
        let diff = diff_array(&a, &a, eq);
        assert!(diff.changes.is_empty());
        assert_eq!(
            diff.element_changes,
            vec![
                ElementChange::Keep {
                    el_index: 0,
                    was_touched: false
                },
                ElementChange::Keep {
                    el_index: 1,
                    was_touched: false
                },
                ElementChange::Keep {
                    el_index: 2,
                    was_touched: false
                },
            ]
        );
    }

    #[test]
    fn reversal_moves_all_but_one() {
        let a = ns(&[1, 2, 3]);
        let b = ns(&[3, 2, 1]);
        let diff = diff_array(&a, &b, eq);
        assert_eq!(apply_array_diff(&a, &diff.changes), b);
        let moves = diff
            .changes
            .iter()
            .filter(|c| matches!(c, ArrayChange::MoveLeft { .. } | ArrayChange::MoveRight { .. }))
            .count();
        assert_eq!(moves, 2);
    }

    #[test]
    fn neighbours_of_inserts_are_touched() {
        let a = ns(&[1, 2]);
        let b = ns(&[1, 9, 2]);
        let diff = diff_array(&a, &b, eq);
        assert_eq!(
            diff.element_changes,
            vec![
                ElementChange::Keep {
                    el_index: 0,
                    was_touched: true
                },
                ElementChange::Keep {
                    el_index: 1,
                    was_touched: true
                },
            ]
        );
        assert_eq!(apply_array_diff(&a, &diff.changes), b);
    }

    #[test]
    fn consecutive_adds_stay_ordered() {
        let a = ns(&[1, 2]);
        let b = ns(&[1, 7, 8, 2]);
        let diff = diff_array(&a, &b, eq);
        assert_eq!(apply_array_diff(&a, &diff.changes), b);

        let a = ns(&[]);
        let b = ns(&[5, 6, 7]);
        let diff = diff_array(&a, &b, eq);
        assert_eq!(apply_array_diff(&a, &diff.changes), b);
    }

    proptest! {
        // applying the script always reproduces the target
        #[test]
        fn round_trip(
            a in proptest::collection::vec(0i32..8, 0..10),
            b in proptest::collection::vec(0i32..8, 0..10),
        ) {
            let a = ns(&a);
            let b = ns(&b);
            let diff = diff_array(&a, &b, eq);
            prop_assert_eq!(apply_array_diff(&a, &diff.changes), b);
            prop_assert_eq!(diff.element_changes.len(), a.len());
        }
    }
}
