use steward_types::{Proposal, UserPreferences};

/// Ranks and caps the candidate proposals for one run. Pure and
/// deterministic for a fixed `(proposals, prefs, now)`:
///
/// 1. only open proposals (active state, end after `now`)
/// 2. deny-listed authors are dropped
/// 3. allow-listed authors sort ahead of everyone else
/// 4. within each partition: closest to close first, then heaviest cast
///    weight, then id as the tie-break
/// 5. truncated to `max_proposals_per_run`
pub fn filter_proposals(
    proposals: &[Proposal],
    prefs: &UserPreferences,
    now: i64,
) -> Vec<Proposal> {
    let mut whitelisted = Vec::new();
    let mut other = Vec::new();

    for proposal in proposals {
        if !proposal.is_open_at(now) {
            continue;
        }
        if prefs.denies(&proposal.author) {
            continue;
        }
        if prefs.allows(&proposal.author) {
            whitelisted.push(proposal.clone());
        } else {
            other.push(proposal.clone());
        }
    }

    let rank = |a: &Proposal, b: &Proposal| {
        a.seconds_to_close(now)
            .cmp(&b.seconds_to_close(now))
            .then_with(|| {
                b.scores_total
                    .partial_cmp(&a.scores_total)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    };
    whitelisted.sort_by(rank);
    other.sort_by(rank);

    whitelisted.extend(other);
    whitelisted.truncate(prefs.max_proposals_per_run as usize);
    whitelisted
}
