//! Channel funding.
//!
//! Depositing funds on a chain is an injected capability. The
//! [MultiAssetFunder] fans one funding request out to the per-asset funders
//! referenced by the request and waits for all of them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::channel::{Asset, Params, PartIdx, State};

#[derive(Debug, thiserror::Error)]
pub enum FundingError {
    #[error("no funder registered for asset")]
    NoFunderForAsset,
    #[error("peer did not fund in time")]
    PeerTimedOut,
    #[error("funding failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FundingReq {
    pub params: Params,
    pub state: State,
    pub idx: PartIdx,
}

/// Deposits our share for every asset of the request and waits until the
/// channel is fully funded by all participants.
#[async_trait]
pub trait Funder: Send + Sync + 'static {
    async fn fund(&self, req: FundingReq) -> Result<(), FundingError>;
}

/// Dispatches funding per asset. A funder registered for several assets is
/// only invoked once per request.
#[derive(Default)]
pub struct MultiAssetFunder {
    funders: HashMap<Vec<u8>, Arc<dyn Funder>>,
}

impl MultiAssetFunder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asset(&mut self, asset: Asset, funder: Arc<dyn Funder>) {
        self.funders.insert(asset.key(), funder);
    }

    fn funders_for_assets(&self, assets: &[Asset]) -> Result<Vec<Arc<dyn Funder>>, FundingError> {
        let mut distinct: Vec<Arc<dyn Funder>> = Vec::new();
        for asset in assets {
            let funder = self
                .funders
                .get(&asset.key())
                .ok_or(FundingError::NoFunderForAsset)?;
            if !distinct.iter().any(|f| Arc::ptr_eq(f, funder)) {
                distinct.push(Arc::clone(funder));
            }
        }
        Ok(distinct)
    }
}

#[async_trait]
impl Funder for MultiAssetFunder {
    async fn fund(&self, req: FundingReq) -> Result<(), FundingError> {
        let funders = self.funders_for_assets(&req.state.allocation.assets)?;

        let mut join = JoinSet::new();
        for funder in funders {
            let req = req.clone();
            join.spawn(async move { funder.fund(req).await });
        }

        let mut result = Ok(());
        while let Some(joined) = join.join_next().await {
            let one = joined.unwrap_or(Err(FundingError::Failed("funder task died".into())));
            if result.is_ok() {
                result = one;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Allocation, Balances};
    use crate::{wallet, U256};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFunder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Funder for CountingFunder {
        async fn fund(&self, _: FundingReq) -> Result<(), FundingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(FundingError::Failed("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn req(rng: &mut StdRng, assets: Vec<Asset>) -> FundingReq {
        let num_assets = assets.len();
        let params = Params {
            challenge_duration: 60,
            nonce: rng.gen(),
            participants: vec![rng.gen(), rng.gen()],
            app: vec![],
            ledger_channel: true,
            virtual_channel: false,
        };
        let alloc = Allocation::new(assets, Balances::zero(num_assets, 2));
        FundingReq {
            state: State::new(&params, alloc, vec![]),
            params,
            idx: 0,
        }
    }

    fn asset(chain: u64, rng: &mut StdRng) -> Asset {
        Asset {
            chain_id: U256::from(chain),
            holder: rng.gen::<wallet::Address>(),
        }
    }

    #[tokio::test]
    async fn duplicate_funders_are_deduplicated() {
        let mut rng = StdRng::seed_from_u64(61);
        let a = asset(1, &mut rng);
        let b = asset(2, &mut rng);

        let funder = Arc::new(CountingFunder {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut multi = MultiAssetFunder::new();
        multi.register_asset(a, Arc::clone(&funder) as Arc<dyn Funder>);
        multi.register_asset(b, Arc::clone(&funder) as Arc<dyn Funder>);

        multi.fund(req(&mut rng, vec![a, b])).await.unwrap();
        assert_eq!(funder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn any_failure_fails_the_request() {
        let mut rng = StdRng::seed_from_u64(62);
        let a = asset(1, &mut rng);
        let b = asset(2, &mut rng);

        let good = Arc::new(CountingFunder {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let bad = Arc::new(CountingFunder {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mut multi = MultiAssetFunder::new();
        multi.register_asset(a, good as Arc<dyn Funder>);
        multi.register_asset(b, bad as Arc<dyn Funder>);

        assert!(multi.fund(req(&mut rng, vec![a, b])).await.is_err());
    }

    #[tokio::test]
    async fn missing_funder_is_an_error() {
        let mut rng = StdRng::seed_from_u64(63);
        let a = asset(1, &mut rng);
        let multi = MultiAssetFunder::new();
        assert!(matches!(
            multi.fund(req(&mut rng, vec![a])).await,
            Err(FundingError::NoFunderForAsset)
        ));
    }
}
