//! Weighted payout allocation
//!
//! Splits a pool of satoshis across weighted recipients with integer-only
//! arithmetic:
//!
//! 1. every recipient gets `floor(pool * weight / basis)`;
//! 2. recipients whose share falls below the dust limit for their
//!    destination are dropped;
//! 3. whatever is left of the pool is spread over the retained recipients,
//!    ranked by amount, then weight (both descending), then key, one sat
//!    per recipient per round.
//!
//! The result sums to the pool exactly and is independent of input order:
//! recipients are put in canonical key order before anything is computed.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use bdk_wallet::bitcoin::{address::NetworkUnchecked, Address, Amount, Network, Script};
use serde::{Deserialize, Serialize};

use crate::error::{PayoutError, Result};

/// Standard dust threshold for every output type.
pub const DUST_LIMIT: u64 = 546;

/// Minimum output value policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DustPolicy {
    /// One threshold for every script type.
    Uniform { limit: u64 },
    /// Per-type relay thresholds: P2TR 330, P2WPKH 294, P2SH 540, P2PKH 546.
    ByScriptType,
}

impl Default for DustPolicy {
    fn default() -> Self {
        DustPolicy::Uniform { limit: DUST_LIMIT }
    }
}

impl DustPolicy {
    pub fn limit_for(&self, script_pubkey: &Script) -> u64 {
        match self {
            DustPolicy::Uniform { limit } => *limit,
            DustPolicy::ByScriptType => {
                if script_pubkey.is_p2tr() {
                    330
                } else if script_pubkey.is_p2wpkh() {
                    294
                } else if script_pubkey.is_p2sh() {
                    540
                } else {
                    DUST_LIMIT
                }
            }
        }
    }
}

/// A recipient ready for allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub key: String,
    pub address: Address,
    pub weight: u64,
}

/// Recipient record as supplied by the profile store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientProfile {
    pub wallet_key: String,
    #[serde(default)]
    pub payout_enabled: bool,
    #[serde(default)]
    pub payout_address: Option<String>,
    pub weight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutAllocation {
    pub recipient_key: String,
    pub destination: Address,
    pub weight: u64,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub pool: Amount,
    /// Retained payouts, in canonical (key) order. Output N of the payout
    /// transaction pays `payouts[N]`.
    pub payouts: Vec<PayoutAllocation>,
    /// Keys of recipients whose share was below dust.
    pub dropped: Vec<String>,
    /// Satoshis handed out on top of the floor shares.
    pub remainder: u64,
}

impl AllocationPlan {
    pub fn total(&self) -> Amount {
        self.payouts.iter().map(|p| p.amount).sum()
    }
}

/// Keep opted-in recipients whose address is valid for `network`.
///
/// Profiles with the same wallet key are merged by summing weights; the
/// first valid address wins.
pub fn eligible_recipients(profiles: &[RecipientProfile], network: Network) -> Vec<Recipient> {
    let mut merged: BTreeMap<String, Recipient> = BTreeMap::new();

    for profile in profiles {
        if !profile.payout_enabled {
            tracing::debug!("Skipping {}: payouts not enabled", profile.wallet_key);
            continue;
        }
        let Some(raw) = profile.payout_address.as_deref() else {
            tracing::debug!("Skipping {}: no payout address", profile.wallet_key);
            continue;
        };
        let address = match parse_address(raw, network) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", profile.wallet_key, e);
                continue;
            }
        };

        merged
            .entry(profile.wallet_key.clone())
            .and_modify(|existing| existing.weight = existing.weight.saturating_add(profile.weight))
            .or_insert_with(|| Recipient {
                key: profile.wallet_key.clone(),
                address,
                weight: profile.weight,
            });
    }

    merged.into_values().collect()
}

/// Parse an address and check it belongs to `network`.
pub fn parse_address(raw: &str, network: Network) -> Result<Address> {
    let unchecked = Address::<NetworkUnchecked>::from_str(raw.trim()).map_err(|e| {
        PayoutError::InvalidAddress {
            address: raw.to_string(),
            reason: e.to_string(),
        }
    })?;
    unchecked
        .require_network(network)
        .map_err(|e| PayoutError::InvalidAddress {
            address: raw.to_string(),
            reason: e.to_string(),
        })
}

/// Allocate `pool` in proportion to each recipient's share of the total weight.
pub fn allocate(pool: Amount, recipients: &[Recipient], dust: &DustPolicy) -> Result<AllocationPlan> {
    allocate_over(pool, recipients, None, dust)
}

/// Allocate `pool` against an explicit weight `basis` (e.g. a collection's
/// total supply). Unissued basis and dropped shares both end up in the
/// remainder.
pub fn allocate_over(
    pool: Amount,
    recipients: &[Recipient],
    basis: Option<u64>,
    dust: &DustPolicy,
) -> Result<AllocationPlan> {
    let recipients = canonicalize(recipients)?;
    let total_weight = recipients
        .iter()
        .try_fold(0u64, |acc, r| acc.checked_add(r.weight))
        .ok_or_else(|| PayoutError::InvalidInput("total recipient weight overflows".to_string()))?;
    if recipients.is_empty() || total_weight == 0 {
        return Err(PayoutError::NoEligibleRecipients);
    }

    let basis = match basis {
        Some(basis) if basis < total_weight => {
            return Err(PayoutError::InvalidInput(format!(
                "weight basis {} is smaller than the total weight {}",
                basis, total_weight
            )))
        }
        Some(basis) => basis,
        None => total_weight,
    };

    let pool_sats = pool.to_sat();
    let mut retained = Vec::new();
    let mut dropped = Vec::new();

    for recipient in recipients {
        let share = (pool_sats as u128 * recipient.weight as u128 / basis as u128) as u64;
        let limit = dust.limit_for(&recipient.address.script_pubkey());
        if share < limit {
            tracing::debug!(
                "Dropping {}: share {} sats is below dust limit {}",
                recipient.key,
                share,
                limit
            );
            dropped.push(recipient.key);
            continue;
        }
        retained.push(PayoutAllocation {
            recipient_key: recipient.key,
            destination: recipient.address,
            weight: recipient.weight,
            amount: Amount::from_sat(share),
        });
    }

    if retained.is_empty() {
        return Err(PayoutError::DustAllocation {
            pool: pool_sats,
            recipients: dropped.len(),
        });
    }

    let floor_total: u64 = retained.iter().map(|p| p.amount.to_sat()).sum();
    let remainder = pool_sats - floor_total;
    distribute_remainder(&mut retained, remainder);

    tracing::info!(
        "🧮 Allocated {} sats to {} recipients ({} dropped as dust, {} sats remainder)",
        pool_sats,
        retained.len(),
        dropped.len(),
        remainder
    );

    Ok(AllocationPlan {
        pool,
        payouts: retained,
        dropped,
        remainder,
    })
}

/// Merge duplicate keys and sort by key.
fn canonicalize(recipients: &[Recipient]) -> Result<Vec<Recipient>> {
    let mut merged: BTreeMap<&str, Recipient> = BTreeMap::new();
    for recipient in recipients {
        match merged.get_mut(recipient.key.as_str()) {
            Some(existing) => {
                existing.weight = existing.weight.checked_add(recipient.weight).ok_or_else(|| {
                    PayoutError::InvalidInput(format!("weight of {} overflows", recipient.key))
                })?;
            }
            None => {
                merged.insert(recipient.key.as_str(), recipient.clone());
            }
        }
    }
    Ok(merged.into_values().collect())
}

/// Round-robin the remainder one sat at a time over the ranked recipients.
///
/// Full rounds are applied in one step; the last partial round goes to the
/// top of the ranking.
fn distribute_remainder(payouts: &mut [PayoutAllocation], remainder: u64) {
    if payouts.is_empty() || remainder == 0 {
        return;
    }

    let mut ranking: Vec<usize> = (0..payouts.len()).collect();
    ranking.sort_by(|&a, &b| rank(&payouts[a], &payouts[b]));

    let count = payouts.len() as u64;
    let per_recipient = remainder / count;
    let extra = (remainder % count) as usize;

    for (position, &index) in ranking.iter().enumerate() {
        let bonus = per_recipient + u64::from(position < extra);
        payouts[index].amount += Amount::from_sat(bonus);
    }
}

fn rank(a: &PayoutAllocation, b: &PayoutAllocation) -> Ordering {
    b.amount
        .cmp(&a.amount)
        .then_with(|| b.weight.cmp(&a.weight))
        .then_with(|| a.recipient_key.cmp(&b.recipient_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Three distinct regtest P2WPKH addresses.
    const ADDR_A: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";
    const ADDR_B: &str = "bcrt1qzyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3lgth6c";
    const ADDR_C: &str = "bcrt1qyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zs4w3j0";

    fn recipient(key: &str, addr: &str, weight: u64) -> Recipient {
        Recipient {
            key: key.to_string(),
            address: parse_address(addr, Network::Regtest).unwrap(),
            weight,
        }
    }

    fn abc() -> Vec<Recipient> {
        vec![
            recipient("A", ADDR_A, 100),
            recipient("B", ADDR_B, 50),
            recipient("C", ADDR_C, 1),
        ]
    }

    fn amounts(plan: &AllocationPlan) -> Vec<(String, u64)> {
        plan.payouts
            .iter()
            .map(|p| (p.recipient_key.clone(), p.amount.to_sat()))
            .collect()
    }

    #[test]
    fn test_supply_basis_drops_dust_and_redistributes() {
        let plan = allocate_over(
            Amount::from_sat(1_000_000),
            &abc(),
            Some(10_000),
            &DustPolicy::default(),
        )
        .unwrap();

        assert_eq!(plan.dropped, vec!["C".to_string()]);
        assert_eq!(plan.total(), Amount::from_sat(1_000_000));
        assert_eq!(
            amounts(&plan),
            vec![("A".to_string(), 502_500), ("B".to_string(), 497_500)]
        );
    }

    #[test]
    fn test_weight_basis_sums_exactly() {
        let plan = allocate(Amount::from_sat(1_000_000), &abc(), &DustPolicy::default()).unwrap();
        assert!(plan.dropped.is_empty());
        assert_eq!(plan.total(), Amount::from_sat(1_000_000));
        // floors are 662251 / 331125 / 6622, remainder 2 goes to A then B
        assert_eq!(
            amounts(&plan),
            vec![
                ("A".to_string(), 662_252),
                ("B".to_string(), 331_126),
                ("C".to_string(), 6_622)
            ]
        );
    }

    #[test]
    fn test_order_independent() {
        let mut reversed = abc();
        reversed.reverse();
        let pool = Amount::from_sat(777_777);
        let forward = allocate(pool, &abc(), &DustPolicy::default()).unwrap();
        let backward = allocate(pool, &reversed, &DustPolicy::default()).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_conservation_over_many_pools() {
        let recipients = vec![
            recipient("A", ADDR_A, 7),
            recipient("B", ADDR_B, 3),
            recipient("C", ADDR_C, 3),
        ];
        for pool in (2_000..50_000).step_by(997) {
            let plan = allocate(Amount::from_sat(pool), &recipients, &DustPolicy::default()).unwrap();
            assert_eq!(plan.total().to_sat(), pool);
            assert!(plan.payouts.iter().all(|p| p.amount.to_sat() >= DUST_LIMIT));
        }
    }

    #[test]
    fn test_ties_break_on_key() {
        let recipients = vec![recipient("B", ADDR_B, 1), recipient("A", ADDR_A, 1)];
        let plan = allocate(Amount::from_sat(10_001), &recipients, &DustPolicy::default()).unwrap();
        assert_eq!(
            amounts(&plan),
            vec![("A".to_string(), 5_001), ("B".to_string(), 5_000)]
        );
    }

    #[test]
    fn test_duplicate_keys_merge() {
        let recipients = vec![
            recipient("A", ADDR_A, 1),
            recipient("B", ADDR_B, 2),
            recipient("A", ADDR_A, 1),
        ];
        let plan = allocate(Amount::from_sat(10_000), &recipients, &DustPolicy::default()).unwrap();
        assert_eq!(plan.payouts.len(), 2);
        assert_eq!(plan.payouts[0].weight, 2);
        assert_eq!(plan.payouts[0].amount, plan.payouts[1].amount);
    }

    #[test]
    fn test_error_cases() {
        assert!(matches!(
            allocate(Amount::from_sat(1_000), &[], &DustPolicy::default()),
            Err(PayoutError::NoEligibleRecipients)
        ));
        assert!(matches!(
            allocate(Amount::from_sat(1_000), &[recipient("A", ADDR_A, 0)], &DustPolicy::default()),
            Err(PayoutError::NoEligibleRecipients)
        ));
        assert!(matches!(
            allocate(Amount::from_sat(500), &abc(), &DustPolicy::default()),
            Err(PayoutError::DustAllocation { pool: 500, recipients: 3 })
        ));
        assert!(matches!(
            allocate(Amount::ZERO, &abc(), &DustPolicy::default()),
            Err(PayoutError::DustAllocation { .. })
        ));
        assert!(matches!(
            allocate_over(Amount::from_sat(1_000_000), &abc(), Some(10), &DustPolicy::default()),
            Err(PayoutError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_weight_overflow_is_rejected() {
        let split = vec![recipient("A", ADDR_A, u64::MAX), recipient("B", ADDR_B, 1)];
        assert!(matches!(
            allocate(Amount::from_sat(10_000), &split, &DustPolicy::default()),
            Err(PayoutError::InvalidInput(_))
        ));

        let merged = vec![recipient("A", ADDR_A, u64::MAX), recipient("A", ADDR_A, 1)];
        assert!(matches!(
            allocate(Amount::from_sat(10_000), &merged, &DustPolicy::default()),
            Err(PayoutError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_script_type_dust_policy() {
        let recipients = vec![recipient("A", ADDR_A, 1), recipient("B", ADDR_B, 1)];
        // 800 sats split in two: 400 each is dust at 546 but not at 294
        assert!(allocate(Amount::from_sat(800), &recipients, &DustPolicy::default()).is_err());
        let plan = allocate(Amount::from_sat(800), &recipients, &DustPolicy::ByScriptType).unwrap();
        assert_eq!(plan.total(), Amount::from_sat(800));
    }

    #[test]
    fn test_eligibility_filter() {
        let profiles = vec![
            RecipientProfile {
                wallet_key: "opted-in".into(),
                payout_enabled: true,
                payout_address: Some(ADDR_A.into()),
                weight: 3,
            },
            RecipientProfile {
                wallet_key: "opted-out".into(),
                payout_enabled: false,
                payout_address: Some(ADDR_B.into()),
                weight: 3,
            },
            RecipientProfile {
                wallet_key: "no-address".into(),
                payout_enabled: true,
                payout_address: None,
                weight: 3,
            },
            RecipientProfile {
                wallet_key: "wrong-network".into(),
                payout_enabled: true,
                payout_address: Some("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into()),
                weight: 3,
            },
            RecipientProfile {
                wallet_key: "opted-in".into(),
                payout_enabled: true,
                payout_address: Some(ADDR_A.into()),
                weight: 2,
            },
        ];
        let eligible = eligible_recipients(&profiles, Network::Regtest);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].key, "opted-in");
        assert_eq!(eligible[0].weight, 5);
    }
}
