//! Deterministic pair selection for a board snapshot.
//!
//! Given the actionable elements of one snapshot and an objective, the matcher
//! proposes at most one pair to click, or explains why none exists. The game
//! rule lives behind [`MatchPredicate`]; the matcher only knows whether a pair
//! is valid and, if so, which kind of match it is.
//!
//! Candidate pairs are visited in order of combined position (`i + j`), then
//! by the lower position, so the first eligible pair is the answer and the
//! result is reproducible for a given snapshot.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::driver::{Element, ElementSnapshot, SnapshotId};

/// Reason reported for a snapshot with no actionable elements
pub const EMPTY_BOARD_REASON: &str = "board is empty";

/// How a valid pair satisfies the rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairKind {
    /// Both values are the same
    Identical,
    /// The values combine to the rule's target
    Complement,
}

/// The game rule deciding whether two elements form a valid pair.
pub trait MatchPredicate: Send + Sync {
    /// `Some(kind)` if the pair is valid, `None` otherwise.
    fn classify(&self, first: &Element, second: &Element) -> Option<PairKind>;

    /// Human-readable description of the pairs of `kind`, or of every valid
    /// pair when `kind` is `None`.
    fn describe(&self, kind: Option<PairKind>) -> String;
}

/// Two values match if identical or if they sum to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumOrIdentical {
    pub target: u64,
}

impl SumOrIdentical {
    pub fn new(target: u64) -> Self {
        Self { target }
    }
}

impl Default for SumOrIdentical {
    fn default() -> Self {
        Self::new(10)
    }
}

impl MatchPredicate for SumOrIdentical {
    fn classify(&self, first: &Element, second: &Element) -> Option<PairKind> {
        let a = first.text.trim();
        let b = second.text.trim();
        if a.is_empty() || b.is_empty() {
            return None;
        }
        if a == b {
            return Some(PairKind::Identical);
        }
        match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) if x.checked_add(y) == Some(self.target) => Some(PairKind::Complement),
            _ => None,
        }
    }

    fn describe(&self, kind: Option<PairKind>) -> String {
        match kind {
            Some(PairKind::Identical) => "identical values".to_string(),
            Some(PairKind::Complement) => format!("values summing to {}", self.target),
            None => format!("identical values or values summing to {}", self.target),
        }
    }
}

/// Restricts an inner rule to neighbouring positions.
///
/// Two positions are neighbours when they are consecutive in reading order or
/// one row apart in a grid of `columns`.
#[derive(Debug, Clone, Copy)]
pub struct Adjacent<P> {
    pub inner: P,
    pub columns: usize,
}

impl<P: MatchPredicate> Adjacent<P> {
    pub fn new(inner: P, columns: usize) -> Self {
        Self { inner, columns }
    }

    fn neighbours(&self, a: usize, b: usize) -> bool {
        let gap = a.abs_diff(b);
        gap == 1 || (self.columns > 0 && gap == self.columns)
    }
}

impl<P: MatchPredicate> MatchPredicate for Adjacent<P> {
    fn classify(&self, first: &Element, second: &Element) -> Option<PairKind> {
        if !self.neighbours(first.position, second.position) {
            return None;
        }
        self.inner.classify(first, second)
    }

    fn describe(&self, kind: Option<PairKind>) -> String {
        format!("adjacent {}", self.inner.describe(kind))
    }
}

/// What the objective asks the attempt to demonstrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Remove a pair of identical values
    Identical,
    /// Remove a pair that sums to the target
    Complement,
    /// Select a pair the rule rejects
    Invalid,
    /// Remove any valid pair
    Any,
}

const INVALID_KEYWORDS: &[&str] = &[
    "invalid",
    "cannot",
    "can't",
    "can not",
    "should not",
    "must not",
    "not be matched",
    "not be removed",
    "non-matching",
    "nonmatching",
    "mismatch",
    "reject",
    "illegal",
    "disallow",
    "prevent",
];

const IDENTICAL_KEYWORDS: &[&str] = &[
    "identical",
    "same number",
    "same value",
    "same digit",
    "equal",
    "duplicate",
];

const COMPLEMENT_KEYWORDS: &[&str] = &[
    "sum",
    "add up",
    "adds up",
    "adding up",
    "add to",
    "adds to",
    "total",
    "complement",
];

impl Intent {
    /// Derive the intent from the objective's wording.
    ///
    /// Negative wording wins. Mentions of both identical and summing pairs, or
    /// of neither, fall back to [`Intent::Any`].
    pub fn classify(objective: &str) -> Self {
        let text = objective.to_lowercase();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

        if mentions(INVALID_KEYWORDS) {
            return Intent::Invalid;
        }
        match (mentions(IDENTICAL_KEYWORDS), mentions(COMPLEMENT_KEYWORDS)) {
            (true, false) => Intent::Identical,
            (false, true) => Intent::Complement,
            _ => Intent::Any,
        }
    }

    /// Whether the objective expects a pair to be removed
    pub fn is_positive(self) -> bool {
        !matches!(self, Intent::Invalid)
    }

    fn accepts(self, kind: Option<PairKind>) -> bool {
        match self {
            Intent::Identical => kind == Some(PairKind::Identical),
            Intent::Complement => kind == Some(PairKind::Complement),
            Intent::Any => kind.is_some(),
            Intent::Invalid => kind.is_none(),
        }
    }

    fn describe(self, predicate: &dyn MatchPredicate) -> String {
        match self {
            Intent::Identical => predicate.describe(Some(PairKind::Identical)),
            Intent::Complement => predicate.describe(Some(PairKind::Complement)),
            Intent::Any => predicate.describe(None),
            Intent::Invalid => format!("a pairing outside the rule ({})", predicate.describe(None)),
        }
    }
}

/// The matcher's answer for one snapshot. Never retried: a failed match is
/// final for the snapshot it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionPlan {
    Actionable {
        snapshot: SnapshotId,
        intent: Intent,
        first: Element,
        second: Element,
    },
    NotActionable {
        snapshot: SnapshotId,
        intent: Intent,
        reason: String,
    },
}

impl ActionPlan {
    pub fn is_actionable(&self) -> bool {
        matches!(self, ActionPlan::Actionable { .. })
    }

    /// Id of the snapshot this plan was derived from
    pub fn snapshot_id(&self) -> SnapshotId {
        match self {
            ActionPlan::Actionable { snapshot, .. } | ActionPlan::NotActionable { snapshot, .. } => *snapshot,
        }
    }

    pub fn intent(&self) -> Intent {
        match self {
            ActionPlan::Actionable { intent, .. } | ActionPlan::NotActionable { intent, .. } => *intent,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ActionPlan::NotActionable { reason, .. } => Some(reason),
            ActionPlan::Actionable { .. } => None,
        }
    }

    /// Position pair for actionable plans
    pub fn positions(&self) -> Option<(usize, usize)> {
        match self {
            ActionPlan::Actionable { first, second, .. } => Some((first.position, second.position)),
            ActionPlan::NotActionable { .. } => None,
        }
    }
}

/// Pure pair selection over snapshots.
#[derive(Clone)]
pub struct ObjectiveMatcher {
    predicate: Arc<dyn MatchPredicate>,
}

impl ObjectiveMatcher {
    pub fn new(predicate: Arc<dyn MatchPredicate>) -> Self {
        Self { predicate }
    }

    pub fn predicate(&self) -> &dyn MatchPredicate {
        self.predicate.as_ref()
    }

    /// Propose the pair to click for `objective` on `snapshot`.
    pub fn match_objective(&self, snapshot: &ElementSnapshot, objective: &str) -> ActionPlan {
        let intent = Intent::classify(objective);

        if snapshot.is_empty() {
            return ActionPlan::NotActionable {
                snapshot: snapshot.id,
                intent,
                reason: EMPTY_BOARD_REASON.to_string(),
            };
        }

        let elements = &snapshot.elements;
        let chosen = pairs_by_combined_position(elements.len()).find(|&(i, j)| {
            let kind = self.predicate.classify(&elements[i], &elements[j]);
            intent.accepts(kind)
        });

        match chosen {
            Some((i, j)) => ActionPlan::Actionable {
                snapshot: snapshot.id,
                intent,
                first: elements[i].clone(),
                second: elements[j].clone(),
            },
            None => ActionPlan::NotActionable {
                snapshot: snapshot.id,
                intent,
                reason: format!(
                    "no eligible pair satisfies {}",
                    intent.describe(self.predicate.as_ref())
                ),
            },
        }
    }
}

impl Default for ObjectiveMatcher {
    fn default() -> Self {
        Self::new(Arc::new(SumOrIdentical::default()))
    }
}

impl std::fmt::Debug for ObjectiveMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectiveMatcher")
            .field("rule", &self.predicate.describe(None))
            .finish()
    }
}

/// Every `(i, j)` with `i < j < n`, ordered by `i + j`, then by `i`.
fn pairs_by_combined_position(n: usize) -> impl Iterator<Item = (usize, usize)> {
    let max_sum = if n < 2 { 0 } else { 2 * n - 3 };
    (1..=max_sum).flat_map(move |sum| {
        let lo = sum.saturating_sub(n - 1);
        (lo..=(sum - 1) / 2).map(move |i| (i, sum - i))
    })
}
