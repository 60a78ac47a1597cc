//! Property tests for signing and backoff.

use std::time::Duration;

use courier_delivery::{
    retry::{backoff_delay, RetryDecision, RetryPolicy, MAX_BACKOFF},
    signing::{sign, verify_signature},
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn signature_round_trips(body in proptest::collection::vec(any::<u8>(), 0..512), secret in "[a-zA-Z0-9_]{1,64}") {
        prop_assert!(verify_signature(&body, &sign(&body, &secret).unwrap(), &secret));
    }

    #[test]
    fn flipping_any_byte_breaks_the_signature(
        body in proptest::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let signature = sign(&body, "whsec_prop").unwrap();
        let mut tampered = body.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;
        prop_assert!(!verify_signature(&tampered, &signature, "whsec_prop"));
    }

    #[test]
    fn backoff_never_decreases_and_never_exceeds_cap(base in 1u64..=3600, attempt in 1i32..40) {
        let base = Duration::from_secs(base);
        let current = backoff_delay(base, attempt);
        let next = backoff_delay(base, attempt + 1);
        prop_assert!(next >= current);
        prop_assert!(next <= MAX_BACKOFF);
        prop_assert!(backoff_delay(base, 1) == base);
    }

    #[test]
    fn retries_are_granted_only_below_max_attempts(max_retries in 0i32..=10, attempt in 1i32..=12) {
        let policy = RetryPolicy { max_attempts: max_retries + 1, base_delay: Duration::from_secs(60) };
        let decision = policy.decide(attempt, chrono::Utc::now());
        prop_assert_eq!(matches!(decision, RetryDecision::Retry { .. }), attempt < max_retries + 1);
    }
}

#[test]
fn sixty_second_base_follows_documented_schedule() {
    let base = Duration::from_secs(60);
    let delays: Vec<u64> = (1..=8).map(|n| backoff_delay(base, n).as_secs()).collect();
    assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
}
