//! Property-based tests for the trust invariants
//!
//! 1. DESCENT: chain verification terminates and accepts exactly the well-formed chains
//! 2. DECAY: token scores never increase with time
//! 3. ATTENUATION: a child's propagation right never exceeds its parent's

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use riven_core::signature::DEFAULT_MAX_CHAIN_DEPTH;
use riven_core::{
    verify_chain_with, AttenuationPolicy, Blessing, ChainFault, DeviceId, SignatureHash,
    TokenHash, TokenLabel, TrustToken, VaultSignature,
};
use std::collections::HashMap;

fn build_chain(len: usize) -> Vec<VaultSignature> {
    let mut sigs = vec![VaultSignature::genesis(DeviceId::generate())];
    for _ in 1..len {
        let id = DeviceId::generate();
        let parent = sigs.last().expect("chain is never empty");
        sigs.push(VaultSignature::child(id, id, parent));
    }
    sigs
}

fn index(sigs: &[VaultSignature]) -> HashMap<SignatureHash, VaultSignature> {
    sigs.iter().map(|s| (s.signature_hash, s.clone())).collect()
}

// =============================================================================
// DESCENT
// =============================================================================

proptest! {
    /// Every intact chain within the bound verifies, reporting its length
    #[test]
    fn prop_intact_chain_verifies(len in 1usize..=33) {
        let sigs = build_chain(len);
        let store = index(&sigs);
        let tip = sigs.last().unwrap();

        let depth = verify_chain_with(
            tip,
            &sigs[0].signature_hash,
            DEFAULT_MAX_CHAIN_DEPTH,
            |h| store.get(h).cloned(),
        );

        prop_assert_eq!(depth, Ok((len - 1) as u32));
    }

    /// Chains longer than the bound are rejected with TooDeep, never looped over
    #[test]
    fn prop_overlong_chain_rejected(len in 2usize..40, max in 0u32..10) {
        prop_assume!((len - 1) as u32 > max);

        let sigs = build_chain(len);
        let store = index(&sigs);
        let mut lookups = 0u32;

        let result = verify_chain_with(
            sigs.last().unwrap(),
            &sigs[0].signature_hash,
            max,
            |h| {
                lookups += 1;
                store.get(h).cloned()
            },
        );

        prop_assert_eq!(result, Err(ChainFault::TooDeep { max }));
        prop_assert!(lookups <= max);
    }

    /// Removing any ancestor breaks verification
    #[test]
    fn prop_missing_ancestor_rejected(len in 2usize..12, hole in 0usize..11) {
        let sigs = build_chain(len);
        let hole = hole % (len - 1);
        let mut store = index(&sigs);
        store.remove(&sigs[hole].signature_hash);

        let result = verify_chain_with(
            sigs.last().unwrap(),
            &sigs[0].signature_hash,
            DEFAULT_MAX_CHAIN_DEPTH,
            |h| store.get(h).cloned(),
        );

        prop_assert_eq!(result, Err(ChainFault::Unresolvable(sigs[hole].signature_hash)));
    }

    /// Flipping any nonce bit of any link is detected
    #[test]
    fn prop_tampered_link_rejected(len in 1usize..8, link in 0usize..8, bit in 0usize..128) {
        let mut sigs = build_chain(len);
        let link = link % len;
        sigs[link].nonce[bit / 8] ^= 1 << (bit % 8);
        let store = index(&sigs);

        let result = verify_chain_with(
            sigs.last().unwrap(),
            &sigs[0].signature_hash,
            DEFAULT_MAX_CHAIN_DEPTH,
            |h| store.get(h).cloned(),
        );

        prop_assert_eq!(result, Err(ChainFault::HashMismatch));
    }
}

// =============================================================================
// DECAY
// =============================================================================

proptest! {
    /// Score is non-increasing in elapsed time and bounded by 0..=100
    #[test]
    fn prop_score_monotone(a in -100_000i64..400_000, b in -100_000i64..400_000) {
        let issued = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let device = DeviceId::generate();
        let token = TrustToken::new(
            device,
            &VaultSignature::genesis(device),
            TokenLabel::Genesis,
            issued,
        );

        let (early, late) = if a <= b { (a, b) } else { (b, a) };
        let early_score = token.score(issued + Duration::seconds(early));
        let late_score = token.score(issued + Duration::seconds(late));

        prop_assert!(late_score <= early_score);
        prop_assert!(early_score <= 100);
    }

    /// Transport strings parse back to the hash they came from
    #[test]
    fn prop_token_string_roundtrip(offset in 0i64..1_000_000, pairing in any::<bool>()) {
        let device = DeviceId::generate();
        let label = if pairing { TokenLabel::Pairing } else { TokenLabel::Genesis };
        let token = TrustToken::new(
            device,
            &VaultSignature::genesis(device),
            label,
            Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap(),
        );

        let encoded = token.encode().unwrap();
        let parsed = TokenHash::parse(&encoded).unwrap();

        prop_assert_eq!(parsed, token.hash().unwrap());
        prop_assert!(token.matches(&parsed).unwrap());
    }
}

// =============================================================================
// ATTENUATION
// =============================================================================

fn policy_strategy() -> impl Strategy<Value = AttenuationPolicy> {
    prop_oneof![
        Just(AttenuationPolicy::Inherit),
        Just(AttenuationPolicy::Terminal),
        (0u32..40).prop_map(|t| AttenuationPolicy::TierLimit { max_propagating_tier: t }),
    ]
}

proptest! {
    /// Along any lineage, propagation can be lost but never regained
    #[test]
    fn prop_attenuation_never_expands(
        policy in policy_strategy(),
        requests in prop::collection::vec(any::<bool>(), 1..32),
    ) {
        let now = Utc::now();
        let authority = SignatureHash::from_bytes([1u8; 32]);
        let mut current = Blessing::genesis(authority, now);

        for (i, requested) in requests.into_iter().enumerate() {
            let tier = i as u32 + 1;
            let allowed = policy.child_can_propagate(current.can_propagate, tier, requested);
            let child = current.inherit(authority, allowed, now).unwrap();

            prop_assert!(!child.can_propagate || current.can_propagate);
            current = child;
        }
    }
}
