//! Reconciler (§4.D): partitions proposed stories against existing
//! children into create / update / unchanged, using longest-common-
//! subsequence-based similarity ratios. Grounded on
//! `agent.py::_analyze_story_changes` in `original_source/`, which uses
//! Python's `difflib.SequenceMatcher(None, a, b).ratio()` with the same
//! 0.8 / 0.9 thresholds this module hard-codes per §4.D.

use std::collections::HashMap;

use crate::models::{ExistingChild, ProposedStory};

const TITLE_MATCH_THRESHOLD: f64 = 0.8;
const CONTENT_UNCHANGED_THRESHOLD: f64 = 0.9;

/// An existing child matched against a proposed story, carrying the
/// fields the tracker adapter needs to apply the update.
#[derive(Debug, Clone)]
pub struct UpdateDecision {
    pub id: String,
    pub new: ProposedStory,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub to_create: Vec<ProposedStory>,
    pub to_update: Vec<UpdateDecision>,
    pub unchanged: Vec<ExistingChild>,
    /// Existing children no proposed story matched at all (distinct from
    /// `unchanged`, which matched a proposal whose content didn't move
    /// enough to count as an update). Candidates for `archive_orphans`.
    pub orphaned: Vec<ExistingChild>,
}

/// Longest-common-subsequence-based similarity ratio in [0, 1], the same
/// shape as Python's `difflib.SequenceMatcher.ratio()`:
/// `2 * |LCS(a, b)| / (len(a) + len(b))`.
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                cur[j] = prev[j - 1] + 1;
            } else {
                cur[j] = prev[j].max(cur[j - 1]);
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    let lcs_len = prev[b.len()];
    (2 * lcs_len) as f64 / (a.len() + b.len()) as f64
}

/// `reconcile(existing, proposed) -> (to_create, to_update, unchanged)`.
///
/// Iteration order of `proposed` determines which proposal takes a
/// scarce existing match (§4.D determinism note) — this is intentional,
/// not a race.
pub fn reconcile(existing: &[ExistingChild], proposed: &[ProposedStory]) -> ReconcileOutcome {
    let mut by_title: HashMap<String, ExistingChild> = existing
        .iter()
        .map(|c| (c.title.to_lowercase(), c.clone()))
        .collect();

    let mut outcome = ReconcileOutcome::default();

    for story in proposed {
        let story_heading_lower = story.heading.to_lowercase();

        let best_match = by_title
            .iter()
            .map(|(title_lower, child)| {
                let sim = lcs_ratio(&story_heading_lower, title_lower);
                (title_lower.clone(), child.clone(), sim)
            })
            .max_by(|(_, _, a), (_, _, b)| a.partial_cmp(b).unwrap());

        match best_match {
            Some((matched_title, child, title_sim)) if title_sim > TITLE_MATCH_THRESHOLD => {
                let existing_content = format!("{} {}", child.title, child.description).to_lowercase();
                let proposed_content = format!(
                    "{} {} {}",
                    story.heading,
                    story.description,
                    story.acceptance_criteria.join(" ")
                )
                .to_lowercase();
                let content_sim = lcs_ratio(&existing_content, &proposed_content);

                if content_sim < CONTENT_UNCHANGED_THRESHOLD {
                    outcome.to_update.push(UpdateDecision {
                        id: child.id.clone(),
                        new: story.clone(),
                    });
                } else {
                    outcome.unchanged.push(child.clone());
                }
                by_title.remove(&matched_title);
            }
            _ => {
                outcome.to_create.push(story.clone());
            }
        }
    }

    // Orphan existing children are preserved, never deleted (§4.D step 3);
    // whether they're folded into `unchanged` or flagged for archival is
    // the caller's call, gated on `archive_orphans` (§9 open question).
    outcome.orphaned.extend(by_title.into_values());

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(id: &str, title: &str, description: &str) -> ExistingChild {
        ExistingChild {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            state: "Active".to_string(),
            parent_id: "E1".to_string(),
        }
    }

    fn story(heading: &str, description: &str, ac: &[&str]) -> ProposedStory {
        ProposedStory {
            heading: heading.to_string(),
            description: description.to_string(),
            acceptance_criteria: ac.iter().map(|s| s.to_string()).collect(),
            priority: None,
            story_points: None,
            technical_context: None,
            business_requirements: None,
            from_fallback_parser: false,
        }
    }

    #[test]
    fn ratio_equal_strings_is_one() {
        assert_eq!(lcs_ratio("hello world", "hello world"), 1.0);
    }

    #[test]
    fn ratio_both_empty_is_one() {
        assert_eq!(lcs_ratio("", ""), 1.0);
    }

    #[test]
    fn empty_proposed_leaves_everything_unchanged() {
        let existing = vec![child("1", "Story A", "desc a"), child("2", "Story B", "desc b")];
        let outcome = reconcile(&existing, &[]);
        assert!(outcome.to_create.is_empty());
        assert!(outcome.to_update.is_empty());
        assert!(outcome.unchanged.is_empty());
        assert_eq!(outcome.orphaned.len(), 2);
    }

    #[test]
    fn s4_title_rename_matches_and_updates() {
        let existing = vec![child("42", "User can log in", "Allows a user to authenticate")];
        let proposed = vec![story(
            "User logs in",
            "Allows a registered user to authenticate with credentials",
            &[],
        )];
        let outcome = reconcile(&existing, &proposed);
        assert_eq!(outcome.to_update.len(), 1);
        assert_eq!(outcome.to_update[0].id, "42");
        assert!(outcome.to_create.is_empty());
    }

    #[test]
    fn second_story_with_same_heading_is_create_after_match_consumed() {
        let existing = vec![child("42", "User can log in", "Allows a user to authenticate")];
        let proposed = vec![
            story("User logs in", "Allows a registered user to authenticate differently", &[]),
            story("User logs in", "A second, unrelated story with this same heading", &[]),
        ];
        let outcome = reconcile(&existing, &proposed);
        assert_eq!(outcome.to_update.len(), 1);
        assert_eq!(outcome.to_create.len(), 1);
    }

    #[test]
    fn unmatched_proposal_is_create() {
        let existing = vec![child("1", "Completely unrelated", "nothing in common")];
        let proposed = vec![story("Brand new capability", "Something never seen before", &[])];
        let outcome = reconcile(&existing, &proposed);
        assert_eq!(outcome.to_create.len(), 1);
        assert_eq!(outcome.orphaned.len(), 1);
    }

    #[test]
    fn near_identical_content_is_unchanged() {
        let existing = vec![child("1", "User can log in", "Allows a user to authenticate via password")];
        let proposed = vec![story(
            "User can log in",
            "Allows a user to authenticate via password",
            &[],
        )];
        let outcome = reconcile(&existing, &proposed);
        assert_eq!(outcome.unchanged.len(), 1);
        assert!(outcome.to_update.is_empty());
    }

    #[test]
    fn partitions_every_input_exactly_once() {
        let existing = vec![child("1", "Story A", "desc a"), child("2", "Story B", "desc b")];
        let proposed = vec![story("Story A updated heading", "a very different body of text entirely", &[])];
        let outcome = reconcile(&existing, &proposed);
        // Every proposed story lands in exactly one of {create, update}.
        assert_eq!(outcome.to_create.len() + outcome.to_update.len(), proposed.len());
        // "Story B" never matched, so it is preserved as orphaned.
        assert!(outcome.orphaned.iter().any(|c| c.id == "2"));
    }
}
