use serde::{Deserialize, Serialize};

use super::{Asset, ChannelId, PartIdx};
use crate::{binenc, U256};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocationError {
    /// A subtraction would make a balance negative.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// The allocation is malformed or violates conservation of funds.
    #[error("invalid allocation")]
    InvalidAllocation,
    /// A sub-allocation with this channel ID already exists.
    #[error("channel already allocated: {0:?}")]
    AlreadyAllocated(ChannelId),
    /// No sub-allocation with this channel ID exists.
    #[error("channel not allocated: {0:?}")]
    NotAllocated(ChannelId),
    /// Two allocations that must carry the same assets do not.
    #[error("assets do not match")]
    AssetMismatch,
}

/// Balance matrix: `0[asset][participant]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Balances(pub Vec<Vec<U256>>);

impl Balances {
    pub fn zero(num_assets: usize, num_parts: usize) -> Self {
        Balances(vec![vec![U256::zero(); num_parts]; num_assets])
    }

    pub fn num_assets(&self) -> usize {
        self.0.len()
    }

    pub fn num_parts(&self) -> usize {
        self.0.first().map_or(0, Vec::len)
    }

    fn same_shape(&self, other: &Balances) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.len() == b.len())
    }

    /// Per-asset totals.
    pub fn sum(&self) -> Vec<U256> {
        self.0
            .iter()
            .map(|asset| {
                asset
                    .iter()
                    .fold(U256::zero(), |acc, b| acc.checked_add(*b).expect("balance sum overflow"))
            })
            .collect()
    }

    pub fn checked_add(&self, other: &Balances) -> Result<Balances, AllocationError> {
        if !self.same_shape(other) {
            return Err(AllocationError::InvalidAllocation);
        }
        let mut out = self.clone();
        for (row, other_row) in out.0.iter_mut().zip(&other.0) {
            for (b, o) in row.iter_mut().zip(other_row) {
                *b = b.checked_add(*o).ok_or(AllocationError::InvalidAllocation)?;
            }
        }
        Ok(out)
    }

    pub fn checked_sub(&self, other: &Balances) -> Result<Balances, AllocationError> {
        if !self.same_shape(other) {
            return Err(AllocationError::InvalidAllocation);
        }
        let mut out = self.clone();
        for (row, other_row) in out.0.iter_mut().zip(&other.0) {
            for (b, o) in row.iter_mut().zip(other_row) {
                *b = b.checked_sub(*o).ok_or(AllocationError::InsufficientFunds)?;
            }
        }
        Ok(out)
    }

    /// Every entry of `self` must be at least the corresponding entry of
    /// `other` (sufficient collateral check).
    pub fn assert_ge(&self, other: &Balances) -> Result<(), AllocationError> {
        if !self.same_shape(other) {
            return Err(AllocationError::InvalidAllocation);
        }
        for (row, other_row) in self.0.iter().zip(&other.0) {
            for (b, o) in row.iter().zip(other_row) {
                if b < o {
                    return Err(AllocationError::InsufficientFunds);
                }
            }
        }
        Ok(())
    }
}

/// Funds reserved inside a parent state for a named child channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubAlloc {
    pub id: ChannelId,
    /// Per-asset totals locked for the child.
    pub bals: Vec<U256>,
    /// Maps a child participant index to the corresponding parent index.
    pub index_map: Vec<PartIdx>,
}

impl SubAlloc {
    pub fn new(id: ChannelId, bals: Vec<U256>, index_map: Vec<PartIdx>) -> Self {
        SubAlloc { id, bals, index_map }
    }

    pub fn balances_equal(&self, sums: &[U256]) -> bool {
        self.bals == sums
    }
}

/// Distribution of all channel funds over assets, participants and locked
/// child channels.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub assets: Vec<Asset>,
    pub balances: Balances,
    pub locked: Vec<SubAlloc>,
}

impl Allocation {
    pub fn new(assets: Vec<Asset>, balances: Balances) -> Self {
        Allocation {
            assets,
            balances,
            locked: Vec::new(),
        }
    }

    /// Shape consistency: one balance row per asset, equal-length rows, and
    /// locked entries covering every asset.
    pub fn validate(&self) -> Result<(), AllocationError> {
        if self.balances.num_assets() != self.assets.len() {
            return Err(AllocationError::InvalidAllocation);
        }
        let parts = self.balances.num_parts();
        if parts == 0 || self.balances.0.iter().any(|row| row.len() != parts) {
            return Err(AllocationError::InvalidAllocation);
        }
        if self.locked.iter().any(|sub| sub.bals.len() != self.assets.len()) {
            return Err(AllocationError::InvalidAllocation);
        }
        Ok(())
    }

    pub fn sub_alloc(&self, id: ChannelId) -> Option<&SubAlloc> {
        self.locked.iter().find(|sub| sub.id == id)
    }

    pub fn add_sub_alloc(&mut self, sub: SubAlloc) -> Result<(), AllocationError> {
        if self.sub_alloc(sub.id).is_some() {
            return Err(AllocationError::AlreadyAllocated(sub.id));
        }
        self.locked.push(sub);
        Ok(())
    }

    pub fn remove_sub_alloc(&mut self, id: ChannelId) -> Result<SubAlloc, AllocationError> {
        let pos = self
            .locked
            .iter()
            .position(|sub| sub.id == id)
            .ok_or(AllocationError::NotAllocated(id))?;
        Ok(self.locked.remove(pos))
    }

    /// Per-asset totals including locked sub-allocations.
    pub fn total(&self) -> Vec<U256> {
        let mut totals = self.balances.sum();
        for sub in &self.locked {
            for (total, locked) in totals.iter_mut().zip(&sub.bals) {
                *total = total.checked_add(*locked).expect("balance sum overflow");
            }
        }
        totals
    }

    /// Conservation of funds: for each asset, the sum of balances plus
    /// locked sums must be preserved by every legal update.
    pub fn assert_equal_sum(&self, other: &Allocation) -> Result<(), AllocationError> {
        if self.assets != other.assets {
            return Err(AllocationError::AssetMismatch);
        }
        if self.total() != other.total() {
            return Err(AllocationError::InvalidAllocation);
        }
        Ok(())
    }
}

/// Compares two sub-allocation lists for byte identity.
pub fn sub_allocs_equal(a: &[SubAlloc], b: &[SubAlloc]) -> bool {
    binenc::to_vec(&a).ok() == binenc::to_vec(&b).ok()
}

/// Widens a child balance matrix to `num_parts` parent columns, placing each
/// child participant's column at the parent index given by `index_map` and
/// zero everywhere else.
pub fn transform_balances(bals: &Balances, num_parts: usize, index_map: &[PartIdx]) -> Balances {
    let mut out = Balances::zero(bals.num_assets(), num_parts);
    for (out_row, row) in out.0.iter_mut().zip(&bals.0) {
        for (child_idx, parent_idx) in index_map.iter().enumerate() {
            out_row[*parent_idx as usize] = row[child_idx];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn asset(rng: &mut StdRng) -> Asset {
        Asset {
            chain_id: U256::from(1337u64),
            holder: rng.gen::<wallet::Address>(),
        }
    }

    fn bals(rows: &[&[u64]]) -> Balances {
        Balances(
            rows.iter()
                .map(|row| row.iter().map(|b| U256::from(*b)).collect())
                .collect(),
        )
    }

    #[test]
    fn sub_underflow_is_insufficient_funds() {
        let a = bals(&[&[10, 10]]);
        let b = bals(&[&[11, 0]]);
        assert_eq!(a.checked_sub(&b), Err(AllocationError::InsufficientFunds));
    }

    #[test]
    fn add_then_sub_round_trips() {
        let a = bals(&[&[10, 10], &[3, 4]]);
        let b = bals(&[&[1, 2], &[3, 0]]);
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.checked_sub(&b).unwrap(), a);
    }

    #[test]
    fn conservation_includes_locked() {
        let mut rng = StdRng::seed_from_u64(11);
        let assets = vec![asset(&mut rng)];

        let mut funded = Allocation::new(assets.clone(), bals(&[&[5, 5]]));
        funded
            .add_sub_alloc(SubAlloc::new(rng.gen(), vec![U256::from(10u64)], vec![0, 1]))
            .unwrap();

        let unfunded = Allocation::new(assets, bals(&[&[10, 10]]));
        assert!(unfunded.assert_equal_sum(&funded).is_ok());

        let short = Allocation::new(funded.assets.clone(), bals(&[&[5, 4]]));
        assert_eq!(
            funded.assert_equal_sum(&short),
            Err(AllocationError::InvalidAllocation)
        );
    }

    #[test]
    fn duplicate_sub_alloc_rejected() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut alloc = Allocation::new(vec![asset(&mut rng)], bals(&[&[10, 10]]));
        let id = rng.gen();
        alloc
            .add_sub_alloc(SubAlloc::new(id, vec![U256::from(1u64)], vec![0, 1]))
            .unwrap();
        assert_eq!(
            alloc.add_sub_alloc(SubAlloc::new(id, vec![U256::from(2u64)], vec![0, 1])),
            Err(AllocationError::AlreadyAllocated(id))
        );
    }

    #[test]
    fn transform_routes_through_index_map() {
        let child = bals(&[&[2, 8]]);
        // Child participant 0 sits at parent index 1 and vice versa.
        let widened = transform_balances(&child, 2, &[1, 0]);
        assert_eq!(widened, bals(&[&[8, 2]]));
    }
}
