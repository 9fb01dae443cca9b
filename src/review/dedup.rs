//! Cross-worker deduplication.
//!
//! Two findings are duplicates when they sit in the same file, their line
//! ranges intersect and the injected [`SimilarityJudge`] agrees. The
//! pairwise relation is closed transitively with union-find, so chains
//! A~B, B~C collapse into one finding even when A and C alone would not.
//!
//! A merged finding keeps its canonical member's category, title, location
//! and source task. Running the pass twice changes nothing as long as the
//! judge reads only those fields.

use super::traits::{Finding, SimilarityJudge};

/// Disjoint-set forest with path halving and union by size.
#[derive(Debug, Clone)]
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
    }
}

/// Collapses duplicate findings.
pub struct Deduplicator<J> {
    judge: J,
}

impl<J: SimilarityJudge> Deduplicator<J> {
    pub fn new(judge: J) -> Self {
        Self { judge }
    }

    fn duplicates(&self, a: &Finding, b: &Finding) -> bool {
        a.location.overlaps(&b.location) && self.judge.similar(a, b)
    }

    /// Merge duplicate groups. Each group takes the slot of its earliest
    /// member; singletons come back untouched. Idempotent under the judge
    /// contract on [`SimilarityJudge`].
    pub fn dedupe(&self, findings: Vec<Finding>) -> Vec<Finding> {
        let n = findings.len();
        let mut sets = UnionFind::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if self.duplicates(&findings[i], &findings[j]) {
                    sets.union(i, j);
                }
            }
        }

        // Group members by root, keyed by the group's first index.
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_of_root = vec![usize::MAX; n];
        for i in 0..n {
            let root = sets.find(i);
            if group_of_root[root] == usize::MAX {
                group_of_root[root] = groups.len();
                groups.push(Vec::new());
            }
            groups[group_of_root[root]].push(i);
        }

        let mut slots: Vec<Option<Finding>> = findings.into_iter().map(Some).collect();
        let mut out = Vec::with_capacity(groups.len());
        for members in groups {
            let mut group = members.iter().filter_map(|&i| slots[i].take());
            let Some(canonical) = group.next() else {
                continue;
            };
            let others: Vec<Finding> = group.collect();
            if others.is_empty() {
                out.push(canonical);
                continue;
            }
            tracing::debug!(
                location = %canonical.location,
                merged = others.len() + 1,
                "Merged duplicate findings"
            );
            out.push(merge_group(canonical, others));
        }
        out
    }
}

/// Fold duplicates into the earliest-ordered member.
fn merge_group(mut canonical: Finding, members: Vec<Finding>) -> Finding {
    let mut descriptions = vec![std::mem::take(&mut canonical.description)];
    let mut suggestions = vec![std::mem::take(&mut canonical.suggestion)];
    let mut contexts = vec![std::mem::take(&mut canonical.code_context)];

    for other in members {
        canonical.severity = canonical.severity.max(other.severity);
        canonical.confidence = canonical.confidence.max(other.confidence);
        canonical.exploitable |= other.exploitable;
        canonical.remote |= other.remote;
        descriptions.push(other.description);
        suggestions.push(other.suggestion);
        contexts.push(other.code_context);
        if other.source_task_id != canonical.source_task_id
            && !canonical.merged_from.contains(&other.source_task_id)
        {
            canonical.merged_from.push(other.source_task_id);
        }
        for id in other.merged_from {
            if id != canonical.source_task_id && !canonical.merged_from.contains(&id) {
                canonical.merged_from.push(id);
            }
        }
    }

    canonical.description = join_distinct(descriptions);
    canonical.suggestion = join_distinct(suggestions);
    canonical.code_context = join_distinct(contexts);
    canonical
}

/// Distinct non-empty texts in first-seen order, blank-line separated.
fn join_distinct(texts: Vec<String>) -> String {
    let mut seen: Vec<String> = Vec::new();
    for text in texts {
        if !text.trim().is_empty() && !seen.contains(&text) {
            seen.push(text);
        }
    }
    seen.join("\n\n")
}

// ── Tests ────────────────────────────────────────────────────────
