//! Heartbeat scheduling.
//!
//! The ledger discretizes time into fixed-length moments; a host must
//! heartbeat once per moment, inside the first 75 % of it, to stay
//! registered. Hosts stagger their sends with a deterministic offset
//! derived from the low 16 bits of their registration token so the hook
//! does not see the whole fleet at once.

use std::time::Duration;

use sashi_core::config::{GovernanceFile, Vote};

use crate::ledger::{Candidate, HeartbeatVote};

/// Retry budget for a heartbeat submission.
pub const HEARTBEAT_MAX_ATTEMPTS: u32 = 3;
/// Delay between heartbeat retries.
pub const HEARTBEAT_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Pad applied when a projected send lands in the first half of a
/// moment, so the hook never reads a previous-moment timestamp.
/// Tunable together with [`FIRST_HALF_FRACTION`].
const FIRST_HALF_PAD_SECS: u64 = 60;
const FIRST_HALF_FRACTION: f64 = 0.5;

/// Inputs to the schedule computation, all in unix seconds except the
/// moment numbers.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleInput {
    /// Current wall clock.
    pub now: u64,
    /// Start of the current moment.
    pub moment_start: u64,
    /// Moment length.
    pub moment_size: u64,
    /// The current moment number.
    pub current_moment: u64,
    /// Moment of the last accepted heartbeat.
    pub last_heartbeat_moment: u64,
    /// Low 16 bits of the host's registration token id.
    pub token_low16: u16,
}

/// Seconds until the next heartbeat should be sent.
///
/// If the host already heartbeat this moment, the send waits for the
/// next moment boundary. Otherwise the send is staggered by the
/// per-host offset: inside the remaining current moment when enough of
/// it is left, else inside the first 75 % of the next moment. Sends
/// projected into the first half of a moment are padded by 60 s.
#[must_use]
pub fn next_heartbeat_delay(input: ScheduleInput) -> u64 {
    let moment_size = input.moment_size.max(1);
    let acceptance_limit = moment_size * 3 / 4;
    let next_moment_start = input.moment_start + moment_size;

    if input.last_heartbeat_moment == input.current_moment {
        return next_moment_start.saturating_sub(input.now);
    }

    let offset = u64::from(input.token_low16) * acceptance_limit / 65535;
    let remaining = next_moment_start.saturating_sub(input.now);

    let mut send_at = if remaining <= acceptance_limit {
        // Late enough in the moment; spread the sends across what is
        // left of it, strictly before the boundary.
        input.now + offset * remaining.saturating_sub(1) / acceptance_limit.max(1)
    } else {
        next_moment_start + offset
    };

    // Keep the hook's moment arithmetic unambiguous near boundaries.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let half = (moment_size as f64 * FIRST_HALF_FRACTION) as u64;
    let position = send_at.saturating_sub(input.moment_start) % moment_size;
    if position < half {
        send_at += FIRST_HALF_PAD_SECS;
    }

    send_at.saturating_sub(input.now)
}

/// The heartbeat payloads for one cadence: one per accepted vote,
/// iterated in on-ledger candidate order, or a single empty heartbeat
/// when no vote applies.
#[must_use]
pub fn plan_payloads(
    governance: &GovernanceFile,
    mut candidates: Vec<Candidate>,
) -> Vec<Option<HeartbeatVote>> {
    candidates.sort_by_key(|c| c.index);
    let votes: Vec<Option<HeartbeatVote>> = candidates
        .iter()
        .filter_map(|candidate| {
            governance.votes.get(&candidate.candidate_id).map(|vote| {
                Some(HeartbeatVote {
                    candidate_id: candidate.candidate_id.clone(),
                    vote: *vote,
                })
            })
        })
        .collect();

    if votes.is_empty() {
        vec![None]
    } else {
        votes
    }
}

/// Helper pairing [`plan_payloads`] with a freshly re-read governance
/// file; the file may have been edited while the reconciler ran.
pub fn plan_from_file(
    governance_path: &std::path::Path,
    candidates: Vec<Candidate>,
) -> Vec<Option<HeartbeatVote>> {
    let governance = GovernanceFile::from_file(governance_path).unwrap_or_default();
    plan_payloads(&governance, candidates)
}

/// Whether the vote file maps this candidate to `support`.
#[must_use]
pub fn supports(governance: &GovernanceFile, candidate_id: &str) -> bool {
    governance.votes.get(candidate_id) == Some(&Vote::Support)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOMENT: u64 = 3600;

    fn input(now: u64, last_hb_moment: u64, token_low16: u16) -> ScheduleInput {
        ScheduleInput {
            now,
            moment_start: now / MOMENT * MOMENT,
            moment_size: MOMENT,
            current_moment: now / MOMENT,
            last_heartbeat_moment: last_hb_moment,
            token_low16,
        }
    }

    #[test]
    fn already_sent_this_moment_waits_for_the_boundary() {
        // Moment 100, 1000s in; already heartbeat this moment.
        let delay = next_heartbeat_delay(input(100 * MOMENT + 1000, 100, 0xffff));
        assert_eq!(delay, MOMENT - 1000);
    }

    #[test]
    fn missed_moment_sends_inside_the_remainder() {
        // 1000s into the moment: remaining 2600 <= 2700 limit. Token 0
        // gives offset 0, but the send sits in the first half of the
        // moment, so the pad applies.
        let now = 100 * MOMENT + 1000;
        assert_eq!(next_heartbeat_delay(input(now, 99, 0)), 60);

        // Max token: full offset spread across the remainder, landing
        // just before the boundary in the second half, no pad.
        let delay = next_heartbeat_delay(input(now, 99, 0xffff));
        assert_eq!(delay, 2599);
    }

    #[test]
    fn early_in_the_moment_targets_the_next_moment() {
        // 100s into the moment: remaining 3500 > 2700 limit; schedule
        // into the first 75% of the next moment.
        let now = 100 * MOMENT + 100;
        let delay = next_heartbeat_delay(input(now, 99, 0));
        // Next boundary is 3500s away; offset 0 lands at the boundary,
        // i.e. in the first half of the next moment, so pad by 60.
        assert_eq!(delay, 3500 + 60);

        let delay = next_heartbeat_delay(input(now, 99, 0xffff));
        // Full offset (2700) lands in the second half; no pad.
        assert_eq!(delay, 3500 + 2700);
    }

    #[test]
    fn offset_is_deterministic_per_token() {
        let now = 100 * MOMENT + 100;
        let a = next_heartbeat_delay(input(now, 99, 0x1234));
        let b = next_heartbeat_delay(input(now, 99, 0x1234));
        assert_eq!(a, b);
    }

    #[test]
    fn payloads_follow_candidate_index_order() {
        let mut governance = GovernanceFile::default();
        governance.votes.insert("candB".into(), Vote::Reject);
        governance.votes.insert("candA".into(), Vote::Support);

        let payloads = plan_payloads(
            &governance,
            vec![
                Candidate {
                    candidate_id: "candA".into(),
                    index: 7,
                },
                Candidate {
                    candidate_id: "candB".into(),
                    index: 3,
                },
            ],
        );
        let ids: Vec<_> = payloads
            .iter()
            .map(|p| p.as_ref().unwrap().candidate_id.clone())
            .collect();
        assert_eq!(ids, vec!["candB", "candA"]);
    }

    #[test]
    fn no_votes_yields_single_empty_heartbeat() {
        let payloads = plan_payloads(&GovernanceFile::default(), Vec::new());
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].is_none());
    }

    #[test]
    fn votes_without_matching_candidates_yield_empty_heartbeat() {
        let mut governance = GovernanceFile::default();
        governance.votes.insert("ghost".into(), Vote::Support);
        let payloads = plan_payloads(&governance, Vec::new());
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].is_none());
    }
}
