//! Timestamp fuzzy matcher.
//!
//! Pairs two sets of items (messages and media, or media and overlays) by the
//! whole second they were captured in. The sweep sees both sets completely
//! before deciding anything, so a bucket is only ever called unambiguous when
//! it holds exactly one item from each side.

use std::collections::BTreeMap;

use crate::models::{CapturedFile, CapturedTimestamp, RawMessage};

/// Anything that carries a captured timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> Option<CapturedTimestamp>;
}

impl Timestamped for CapturedFile {
    fn timestamp(&self) -> Option<CapturedTimestamp> {
        Some(self.captured())
    }
}

impl Timestamped for RawMessage {
    fn timestamp(&self) -> Option<CapturedTimestamp> {
        self.timestamp
    }
}

impl<T: Timestamped> Timestamped for &T {
    fn timestamp(&self) -> Option<CapturedTimestamp> {
        (**self).timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Unambiguous,
    Ambiguous,
}

/// Tentative pairing from a bucket with exactly one item on each side.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationCandidate<A, B> {
    pub bucket: i64,
    pub a: A,
    pub b: B,
    pub confidence: Confidence,
}

/// Every item competing for one bucket. Terminal: never resolved automatically.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguityGroup<A, B> {
    pub bucket: i64,
    pub a: Vec<A>,
    pub b: Vec<B>,
}

impl<A, B> AmbiguityGroup<A, B> {
    pub fn len(&self) -> usize {
        self.a.len() + self.b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty() && self.b.is_empty()
    }

    /// Every pairing a reviewer would have to choose between, each marked ambiguous.
    pub fn candidates(&self) -> Vec<AssociationCandidate<&A, &B>> {
        self.a
            .iter()
            .flat_map(|a| {
                self.b.iter().map(move |b| AssociationCandidate {
                    bucket: self.bucket,
                    a,
                    b,
                    confidence: Confidence::Ambiguous,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketOutcome<A, B> {
    Matched(AssociationCandidate<A, B>),
    Ambiguous(AmbiguityGroup<A, B>),
    /// `bucket` is `None` for items with no timestamp at all
    OrphanA { bucket: Option<i64>, items: Vec<A> },
    OrphanB { bucket: Option<i64>, items: Vec<B> },
}

struct Bucket<A, B> {
    a: Vec<A>,
    b: Vec<B>,
}

impl<A, B> Default for Bucket<A, B> {
    fn default() -> Self {
        Self {
            a: Vec::new(),
            b: Vec::new(),
        }
    }
}

/// Full sweep over both sets. Outcomes come back in ascending bucket order;
/// items keep their input order inside a bucket. Untimestamped items are
/// reported last as orphans.
pub fn sweep<A: Timestamped, B: Timestamped>(a: Vec<A>, b: Vec<B>) -> Vec<BucketOutcome<A, B>> {
    let mut buckets: BTreeMap<i64, Bucket<A, B>> = BTreeMap::new();
    let mut untimed_a = Vec::new();
    let mut untimed_b = Vec::new();

    for item in a {
        match item.timestamp() {
            Some(ts) => buckets.entry(ts.bucket()).or_default().a.push(item),
            None => untimed_a.push(item),
        }
    }
    for item in b {
        match item.timestamp() {
            Some(ts) => buckets.entry(ts.bucket()).or_default().b.push(item),
            None => untimed_b.push(item),
        }
    }

    let mut outcomes = Vec::with_capacity(buckets.len() + 2);
    for (bucket, Bucket { mut a, mut b }) in buckets {
        match (a.len(), b.len()) {
            (1, 1) => {
                let (Some(a), Some(b)) = (a.pop(), b.pop()) else {
                    continue;
                };
                outcomes.push(BucketOutcome::Matched(AssociationCandidate {
                    bucket,
                    a,
                    b,
                    confidence: Confidence::Unambiguous,
                }));
            }
            (0, _) => outcomes.push(BucketOutcome::OrphanB {
                bucket: Some(bucket),
                items: b,
            }),
            (_, 0) => outcomes.push(BucketOutcome::OrphanA {
                bucket: Some(bucket),
                items: a,
            }),
            _ => outcomes.push(BucketOutcome::Ambiguous(AmbiguityGroup { bucket, a, b })),
        }
    }

    if !untimed_a.is_empty() {
        outcomes.push(BucketOutcome::OrphanA {
            bucket: None,
            items: untimed_a,
        });
    }
    if !untimed_b.is_empty() {
        outcomes.push(BucketOutcome::OrphanB {
            bucket: None,
            items: untimed_b,
        });
    }
    outcomes
}

/// Sweep result split by outcome kind.
#[derive(Debug)]
pub struct MatchOutcome<A, B> {
    pub matched: Vec<AssociationCandidate<A, B>>,
    pub ambiguous: Vec<AmbiguityGroup<A, B>>,
    pub orphans_a: Vec<A>,
    pub orphans_b: Vec<B>,
}

impl<A, B> MatchOutcome<A, B> {
    pub fn from_outcomes(outcomes: Vec<BucketOutcome<A, B>>) -> Self {
        let mut result = Self {
            matched: Vec::new(),
            ambiguous: Vec::new(),
            orphans_a: Vec::new(),
            orphans_b: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                BucketOutcome::Matched(c) => result.matched.push(c),
                BucketOutcome::Ambiguous(g) => result.ambiguous.push(g),
                BucketOutcome::OrphanA { items, .. } => result.orphans_a.extend(items),
                BucketOutcome::OrphanB { items, .. } => result.orphans_b.extend(items),
            }
        }
        result
    }
}

pub fn match_by_timestamp<A: Timestamped, B: Timestamped>(a: Vec<A>, b: Vec<B>) -> MatchOutcome<A, B> {
    MatchOutcome::from_outcomes(sweep(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: &'static str,
        ts: Option<CapturedTimestamp>,
    }

    fn at(name: &'static str, secs: i64) -> Item {
        Item {
            name,
            ts: Some(CapturedTimestamp::from_epoch_secs(secs)),
        }
    }

    impl Timestamped for Item {
        fn timestamp(&self) -> Option<CapturedTimestamp> {
            self.ts
        }
    }

    #[test]
    fn test_one_to_one_is_unambiguous() {
        let out = match_by_timestamp(vec![at("video", 100)], vec![at("overlay", 100)]);
        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].a.name, "video");
        assert_eq!(out.matched[0].b.name, "overlay");
        assert_eq!(out.matched[0].confidence, Confidence::Unambiguous);
        assert!(out.ambiguous.is_empty());
    }

    #[test]
    fn test_two_by_two_bucket_is_one_group() {
        let out = match_by_timestamp(
            vec![at("m1", 1000), at("m2", 1000)],
            vec![at("o1", 1000), at("o2", 1000)],
        );
        assert!(out.matched.is_empty());
        assert!(out.orphans_a.is_empty());
        assert!(out.orphans_b.is_empty());
        assert_eq!(out.ambiguous.len(), 1);
        let group = &out.ambiguous[0];
        assert_eq!(group.len(), 4);
        assert_eq!(group.bucket, 1000);
        let a: Vec<_> = group.a.iter().map(|i| i.name).collect();
        let b: Vec<_> = group.b.iter().map(|i| i.name).collect();
        assert_eq!(a, ["m1", "m2"]);
        assert_eq!(b, ["o1", "o2"]);
    }

    #[test]
    fn test_subsecond_difference_same_bucket() {
        use chrono::{TimeZone, Utc};
        let early = Item {
            name: "a",
            ts: Some(CapturedTimestamp::from_recorded(
                Utc.timestamp_opt(500, 10_000_000).unwrap(),
            )),
        };
        let late = Item {
            name: "b",
            ts: Some(CapturedTimestamp::from_recorded(
                Utc.timestamp_opt(500, 990_000_000).unwrap(),
            )),
        };
        let out = match_by_timestamp(vec![early], vec![late]);
        assert_eq!(out.matched.len(), 1);
    }

    #[test]
    fn test_skewed_bucket_is_one_group() {
        // 3 media against 1 overlay in the same second
        let out = match_by_timestamp(
            vec![at("m1", 7), at("m2", 7), at("m3", 7)],
            vec![at("o1", 7)],
        );
        assert!(out.matched.is_empty());
        assert_eq!(out.ambiguous.len(), 1);
        let group = &out.ambiguous[0];
        assert_eq!(group.len(), 4);
        let names: Vec<_> = group.a.iter().map(|i| i.name).collect();
        assert_eq!(names, ["m1", "m2", "m3"]);
        let cands = group.candidates();
        assert_eq!(cands.len(), 3);
        assert!(cands.iter().all(|c| c.confidence == Confidence::Ambiguous));
    }

    #[test]
    fn test_one_side_empty_is_orphan() {
        let outcomes = sweep(vec![at("a1", 1), at("a2", 1)], vec![at("b1", 2)]);
        assert_eq!(outcomes.len(), 2);
        match &outcomes[0] {
            BucketOutcome::OrphanA { bucket, items } => {
                assert_eq!(*bucket, Some(1));
                assert_eq!(items.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&outcomes[1], BucketOutcome::OrphanB { bucket: Some(2), .. }));
    }

    #[test]
    fn test_untimed_items_are_orphans() {
        let untimed = Item { name: "x", ts: None };
        let out = match_by_timestamp(vec![untimed], vec![at("b", 5)]);
        assert_eq!(out.orphans_a.len(), 1);
        assert_eq!(out.orphans_b.len(), 1);
    }

    #[test]
    fn test_every_item_accounted_for_once() {
        let a: Vec<Item> = [1, 1, 2, 3, 3, 3, 5, 8].iter().map(|&s| at("a", s)).collect();
        let b: Vec<Item> = [1, 2, 2, 3, 4, 8].iter().map(|&s| at("b", s)).collect();
        let (na, nb) = (a.len(), b.len());
        let out = match_by_timestamp(a, b);

        let a_seen = out.matched.len()
            + out.ambiguous.iter().map(|g| g.a.len()).sum::<usize>()
            + out.orphans_a.len();
        let b_seen = out.matched.len()
            + out.ambiguous.iter().map(|g| g.b.len()).sum::<usize>()
            + out.orphans_b.len();
        assert_eq!(a_seen, na);
        assert_eq!(b_seen, nb);

        // bucket 8 is the only 1:1
        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].bucket, 8);
        for group in &out.ambiguous {
            assert!(!group.a.is_empty() && !group.b.is_empty());
            assert!(group.a.len() >= 2 || group.b.len() >= 2);
        }
    }

    #[test]
    fn test_output_order_is_deterministic() {
        let run = || {
            sweep(
                vec![at("a", 30), at("b", 10), at("c", 20)],
                vec![at("x", 20), at("y", 10)],
            )
            .into_iter()
            .map(|o| match o {
                BucketOutcome::Matched(c) => c.bucket,
                BucketOutcome::Ambiguous(g) => g.bucket,
                BucketOutcome::OrphanA { bucket, .. } | BucketOutcome::OrphanB { bucket, .. } => {
                    bucket.unwrap_or(i64::MAX)
                }
            })
            .collect::<Vec<_>>()
        };
        assert_eq!(run(), vec![10, 20, 30]);
        assert_eq!(run(), run());
    }
}
