//! Quorum rules over APPROVE tallies and ORDER proof bundles.
//!
//! The leader partitions APPROVE replies by response digest: the largest
//! same-digest group is the candidate correct set, and it must exceed `f` to
//! justify a CONFIRM. Followers re-check the leader's proof bundle from their
//! own side before validating.

use std::collections::BTreeMap;

use sievekv_crypto::verify_response;
use sievekv_types::{Epoch, Operation, ProcessId};
use sievekv_wire::Message;

/// A tally of replies keyed by sender.
pub type Tally = BTreeMap<ProcessId, Message>;

/// Partitions `tally` by response digest, considering only replies about
/// exactly (`config`, `op`), and returns the largest group. Ties go to the
/// digest seen first in sender order.
pub fn largest_signature_group(tally: &Tally, config: Epoch, op: &Operation) -> Tally {
    let mut groups: Vec<(&str, Vec<ProcessId>)> = Vec::new();

    for (pid, message) in tally {
        if !message.is_about(config, op) {
            continue;
        }
        let Some(sign) = message.sign.as_deref() else {
            continue;
        };
        match groups.iter_mut().find(|(s, _)| *s == sign) {
            Some((_, members)) => members.push(*pid),
            None => groups.push((sign, vec![*pid])),
        }
    }

    let mut winners: Vec<ProcessId> = Vec::new();
    for (_, members) in groups {
        if members.len() > winners.len() {
            winners = members;
        }
    }

    winners
        .into_iter()
        .filter_map(|pid| tally.get(&pid).map(|m| (pid, m.clone())))
        .collect()
}

/// Checks a CONFIRM proof bundle from this replica's perspective: at least
/// `f + 1` replies, all byte-equal, whose digest verifies against the
/// replica's own speculative response.
pub fn confirms_own_response(msg_set: &Tally, response: &Operation, f: usize) -> bool {
    if msg_set.len() < f + 1 {
        return false;
    }
    let Some(first) = msg_set.values().next() else {
        return false;
    };
    let Some(sign) = first.sign.as_deref() else {
        return false;
    };
    msg_set.values().all(|m| m == first) && verify_response(response, sign)
}

/// Checks an ABORT proof bundle: at least `2f + 1` replies among which no
/// same-digest group about (`config`, `cur`) could have reached `f + 1` —
/// that is, no correct quorum was possible. A replica that never produced a
/// current operation treats every group as empty.
pub fn justifies_abort(msg_set: &Tally, f: usize, config: Epoch, cur: Option<&Operation>) -> bool {
    if msg_set.len() < 2 * f + 1 {
        return false;
    }
    let largest = match cur {
        Some(op) => largest_signature_group(msg_set, config, op).len(),
        None => 0,
    };
    largest <= f
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sievekv_crypto::sign_response;

    fn approve(config: Epoch, op: &Operation, sign: &str) -> Message {
        Message::approve(config, op.clone(), sign.to_string())
    }

    fn tally_of(entries: Vec<(u64, Message)>) -> Tally {
        entries
            .into_iter()
            .map(|(pid, m)| (ProcessId::new(pid), m))
            .collect()
    }

    #[test]
    fn largest_group_wins() {
        let op = Operation::new("a", 1);
        let c = Epoch::ZERO;
        let tally = tally_of(vec![
            (1, approve(c, &op, "good")),
            (2, approve(c, &op, "good")),
            (3, approve(c, &op, "bad-3")),
            (4, approve(c, &op, "bad-4")),
        ]);

        let group = largest_signature_group(&tally, c, &op);
        assert_eq!(group.len(), 2);
        assert!(group.contains_key(&ProcessId::new(1)));
        assert!(group.contains_key(&ProcessId::new(2)));
    }

    #[test]
    fn replies_about_other_rounds_are_excluded() {
        let op = Operation::new("a", 1);
        let other = Operation::new("b", 2);
        let c = Epoch::ZERO;
        let tally = tally_of(vec![
            (1, approve(c, &op, "good")),
            (2, approve(Epoch::new(7), &op, "good")),
            (3, approve(c, &other, "good")),
        ]);

        let group = largest_signature_group(&tally, c, &op);
        assert_eq!(group.len(), 1);
        assert!(group.contains_key(&ProcessId::new(1)));
    }

    #[test]
    fn confirm_bundle_requires_agreement_and_matching_digest() {
        let op = Operation::new("a", 1);
        let c = Epoch::ZERO;
        let sign = sign_response(&op);
        let f = 1;

        // Too small
        let small = tally_of(vec![(1, approve(c, &op, &sign))]);
        assert!(!confirms_own_response(&small, &op, f));

        // Agreeing and verifying
        let good = tally_of(vec![(1, approve(c, &op, &sign)), (2, approve(c, &op, &sign))]);
        assert!(confirms_own_response(&good, &op, f));

        // Large enough but digests disagree with our response
        let mangled = Operation::new("a", "1FAULTY9");
        let foreign = sign_response(&mangled);
        let wrong = tally_of(vec![
            (1, approve(c, &op, &foreign)),
            (2, approve(c, &op, &foreign)),
        ]);
        assert!(!confirms_own_response(&wrong, &op, f));

        // Mixed bundles never confirm
        let mixed = tally_of(vec![
            (1, approve(c, &op, &sign)),
            (2, approve(c, &op, &foreign)),
        ]);
        assert!(!confirms_own_response(&mixed, &op, f));
    }

    #[test]
    fn abort_bundle_needs_full_tally_without_a_quorum_group() {
        let op = Operation::new("a", 1);
        let c = Epoch::ZERO;
        let f = 1;

        // 2f + 1 replies, all digests distinct: abort justified.
        let split = tally_of(vec![
            (1, approve(c, &op, "s1")),
            (2, approve(c, &op, "s2")),
            (3, approve(c, &op, "s3")),
        ]);
        assert!(justifies_abort(&split, f, c, Some(&op)));

        // A group of f + 1 exists: a correct quorum was possible.
        let quorate = tally_of(vec![
            (1, approve(c, &op, "s1")),
            (2, approve(c, &op, "s1")),
            (3, approve(c, &op, "s3")),
        ]);
        assert!(!justifies_abort(&quorate, f, c, Some(&op)));

        // Too few replies.
        let short = tally_of(vec![(1, approve(c, &op, "s1")), (2, approve(c, &op, "s2"))]);
        assert!(!justifies_abort(&short, f, c, Some(&op)));

        // No own operation: every group is vacuously small.
        assert!(justifies_abort(&split, f, c, None));
    }

    proptest! {
        /// The winning group is never smaller than any digest's actual count.
        #[test]
        fn largest_group_is_maximal(signs in proptest::collection::vec(0u8..4, 3..12)) {
            let op = Operation::new("k", 1);
            let c = Epoch::ZERO;
            let tally: Tally = signs
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    (
                        ProcessId::new(i as u64 + 1),
                        approve(c, &op, &format!("sig-{s}")),
                    )
                })
                .collect();

            let winner = largest_signature_group(&tally, c, &op).len();
            for digest in 0u8..4 {
                let count = signs.iter().filter(|s| **s == digest).count();
                prop_assert!(winner >= count);
            }
            prop_assert!(winner >= 1);
        }
    }
}
