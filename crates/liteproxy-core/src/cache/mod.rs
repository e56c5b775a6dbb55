//! Snapshot-consistent block/state cache.
//!
//! One table per entity family (master blocks, raw blocks, account states,
//! transactions, library cells) plus the zero-state singleton and the
//! moving masterchain tip. Every miss goes through a per-key
//! [`SingleFlight`] so a cold key costs exactly one backend fetch no
//! matter how many clients ask for it concurrently; only successful
//! fetches are published, errors are re-fetched by the next caller.
//!
//! Values are immutable after publication and shared via `Arc`, so reads
//! take no lock beyond the table lookup itself. Every entity derived from
//! the moving tip carries the concrete [`BlockId`] it was computed
//! against.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use everscale_types::boc::Boc;
use everscale_types::cell::{Cell, HashBytes, Load};
use everscale_types::dict::Dict;
use everscale_types::merkle::MerkleProof;
use everscale_types::models::{
    BlockId, BlockchainConfigParams, ShardHashes, ShardStateUnsplit, StdAddr,
};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::backend::{self, BackendError, LiteBackend};
use crate::proto::{self, codes, LsError};

mod single_flight;
pub mod tip;

pub use single_flight::SingleFlight;

/// Per-table sizing and tip-tracking knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub masters_capacity: usize,
    pub blocks_capacity: usize,
    pub accounts_capacity: usize,
    pub transactions_capacity: usize,
    pub libraries_capacity: usize,
    /// Master blocks younger than this are never evicted, so lookups
    /// resolved against a recent master cannot race with eviction.
    pub master_retention: Duration,
    pub tip_poll_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            masters_capacity: 64,
            blocks_capacity: 2048,
            accounts_capacity: 8192,
            transactions_capacity: 8192,
            libraries_capacity: 4096,
            master_retention: Duration::from_secs(60),
            tip_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Ls(#[from] LsError),

    #[error("{context}: {reason}")]
    Internal {
        context: &'static str,
        reason: Arc<anyhow::Error>,
    },
}

impl CacheError {
    pub fn internal(context: &'static str, reason: impl Into<anyhow::Error>) -> Self {
        Self::Internal { context, reason: Arc::new(reason.into()) }
    }
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Ls(ls) => Self::Ls(ls),
            other => Self::internal("backend query failed", other),
        }
    }
}

/// A fully resolved master block: the governance config, the state hash
/// and the top shard references all bound to one [`BlockId`].
pub struct MasterBlock {
    pub id: BlockId,
    pub gen_utime: u32,
    pub state_hash: HashBytes,
    pub config: BlockchainConfigParams,
    pub shard_hashes: ShardHashes,
}

struct MasterEntry {
    block: Arc<MasterBlock>,
    added_at: Instant,
}

type AccountKey = (BlockId, StdAddr);
type TransactionKey = (BlockId, StdAddr, u64);

struct Inner {
    backend: Arc<dyn LiteBackend>,
    config: CacheConfig,

    masters: Mutex<LruCache<BlockId, MasterEntry>>,
    blocks: Mutex<LruCache<BlockId, Arc<proto::BlockData>>>,
    accounts: Mutex<LruCache<AccountKey, Arc<proto::AccountState>>>,
    transactions: Mutex<LruCache<TransactionKey, Arc<proto::TransactionInfo>>>,
    libraries: Mutex<LruCache<HashBytes, Cell>>,

    last: ArcSwapOption<MasterBlock>,
    zero_state: ArcSwapOption<proto::ZeroStateIdExt>,
    tip_tx: watch::Sender<u32>,
    tip_lock: Mutex<()>,

    master_flights: SingleFlight<BlockId, Arc<MasterBlock>, CacheError>,
    last_flight: SingleFlight<(), Arc<MasterBlock>, CacheError>,
    block_flights: SingleFlight<BlockId, Arc<proto::BlockData>, CacheError>,
    account_flights: SingleFlight<AccountKey, Arc<proto::AccountState>, CacheError>,
    transaction_flights: SingleFlight<TransactionKey, Arc<proto::TransactionInfo>, CacheError>,
    library_flights: SingleFlight<Vec<HashBytes>, Arc<Vec<(HashBytes, Cell)>>, CacheError>,
}

/// Shared handle to the cache. Cloning is cheap.
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<Inner>,
}

impl BlockCache {
    pub fn new(backend: Arc<dyn LiteBackend>, config: CacheConfig) -> Self {
        let (tip_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                backend,
                masters: Mutex::new(LruCache::unbounded()),
                blocks: Mutex::new(LruCache::new(
                    NonZeroUsize::new(config.blocks_capacity).unwrap_or(NonZeroUsize::MIN),
                )),
                accounts: Mutex::new(LruCache::new(
                    NonZeroUsize::new(config.accounts_capacity).unwrap_or(NonZeroUsize::MIN),
                )),
                transactions: Mutex::new(LruCache::new(
                    NonZeroUsize::new(config.transactions_capacity).unwrap_or(NonZeroUsize::MIN),
                )),
                libraries: Mutex::new(LruCache::new(
                    NonZeroUsize::new(config.libraries_capacity).unwrap_or(NonZeroUsize::MIN),
                )),
                last: ArcSwapOption::empty(),
                zero_state: ArcSwapOption::empty(),
                tip_tx,
                tip_lock: Mutex::new(()),
                master_flights: SingleFlight::new(),
                last_flight: SingleFlight::new(),
                block_flights: SingleFlight::new(),
                account_flights: SingleFlight::new(),
                transaction_flights: SingleFlight::new(),
                library_flights: SingleFlight::new(),
                config,
            }),
        }
    }

    /// Current masterchain tip, fetched on demand when the tracker has not
    /// published one yet.
    pub async fn last_master_block(&self) -> Result<(Arc<MasterBlock>, bool), CacheError> {
        if let Some(block) = self.inner.last.load_full() {
            return Ok((block, true));
        }
        let cache = self.clone();
        let (res, _) = self
            .inner
            .last_flight
            .run((), move || async move { cache.fetch_last().await })
            .await;
        res.map(|block| (block, false))
    }

    /// Resolves the tip from scratch: ask the backend where it is, then
    /// resolve that master block like any other and publish it.
    async fn fetch_last(self) -> Result<Arc<MasterBlock>, CacheError> {
        let req = proto::GetMasterchainInfoExt { mode: 0 };
        let info: proto::MasterchainInfoExt = backend::query(&*self.inner.backend, &req).await?;
        self.inner.store_zero_state(info.init);

        let id = info.last.as_block_id()?;
        let (block, _) = self.master_block(&id).await?;
        self.inner.publish_last(block.clone());
        Ok(block)
    }

    /// Master block by id. The id must point into the masterchain and the
    /// backend reply must bind to exactly this id.
    pub async fn master_block(&self, id: &BlockId) -> Result<(Arc<MasterBlock>, bool), CacheError> {
        if !id.is_masterchain() {
            return Err(LsError::new(codes::BAD_REQUEST, "not a masterchain block").into());
        }
        if let Some(block) = self.inner.last.load_full() {
            if block.id == *id {
                return Ok((block, true));
            }
        }
        if let Some(entry) = self.inner.masters.lock().get(id) {
            return Ok((entry.block.clone(), true));
        }
        let inner = self.inner.clone();
        let id = *id;
        let (res, _) = self
            .inner
            .master_flights
            .run(id, move || async move { Inner::fetch_master(inner, id).await })
            .await;
        res.map(|block| (block, false))
    }

    /// Raw block data by id.
    pub async fn block(&self, id: &BlockId) -> Result<(Arc<proto::BlockData>, bool), CacheError> {
        if let Some(data) = self.inner.blocks.lock().get(id) {
            return Ok((data.clone(), true));
        }
        let inner = self.inner.clone();
        let id = *id;
        let (res, _) = self
            .inner
            .block_flights
            .run(id, move || async move {
                let req = proto::GetBlockData { id: proto::BlockIdExt::from(&id) };
                let resp: proto::BlockData = backend::query(&*inner.backend, &req).await?;
                Inner::check_reply_id(&id, &resp.id)?;
                let resp = Arc::new(resp);
                inner.blocks.lock().put(id, resp.clone());
                Ok(resp)
            })
            .await;
        res.map(|data| (data, false))
    }

    /// Account state as of the given master block. The reply is keyed by
    /// `(master, address)`, so the same address at another master block is
    /// a different entity.
    pub async fn account_state(
        &self,
        master: &Arc<MasterBlock>,
        addr: &StdAddr,
    ) -> Result<(Arc<proto::AccountState>, bool), CacheError> {
        let key = (master.id, addr.clone());
        if let Some(state) = self.inner.accounts.lock().get(&key) {
            return Ok((state.clone(), true));
        }
        let inner = self.inner.clone();
        let master_id = master.id;
        let account = proto::AccountId::from(addr);
        let (res, _) = self
            .inner
            .account_flights
            .run(key.clone(), move || async move {
                let req = proto::GetAccountState {
                    id: proto::BlockIdExt::from(&master_id),
                    account,
                };
                let resp: proto::AccountState = backend::query(&*inner.backend, &req).await?;
                Inner::check_reply_id(&master_id, &resp.id)?;
                let resp = Arc::new(resp);
                inner.accounts.lock().put(key, resp.clone());
                Ok(resp)
            })
            .await;
        res.map(|state| (state, false))
    }

    /// Exact-match transaction lookup.
    pub async fn transaction(
        &self,
        id: &BlockId,
        addr: &StdAddr,
        lt: u64,
    ) -> Result<(Arc<proto::TransactionInfo>, bool), CacheError> {
        let key = (*id, addr.clone(), lt);
        if let Some(tx) = self.inner.transactions.lock().get(&key) {
            return Ok((tx.clone(), true));
        }
        let inner = self.inner.clone();
        let block_id = *id;
        let account = proto::AccountId::from(addr);
        let (res, _) = self
            .inner
            .transaction_flights
            .run(key.clone(), move || async move {
                let req = proto::GetOneTransaction {
                    id: proto::BlockIdExt::from(&block_id),
                    account,
                    lt,
                };
                let resp: proto::TransactionInfo = backend::query(&*inner.backend, &req).await?;
                Inner::check_reply_id(&block_id, &resp.id)?;
                let resp = Arc::new(resp);
                inner.transactions.lock().put(key, resp.clone());
                Ok(resp)
            })
            .await;
        res.map(|tx| (tx, false))
    }

    /// Resolves a set of library hashes into a dictionary. Library cells
    /// are content-addressed and global, so hits and misses mix freely;
    /// `was_cached` is true only when every hash was already present.
    pub async fn libraries(
        &self,
        hashes: &[HashBytes],
    ) -> Result<(Dict<HashBytes, Cell>, bool), CacheError> {
        let mut dict = Dict::new();
        let mut missing = Vec::new();
        {
            let mut cached = self.inner.libraries.lock();
            for hash in hashes {
                match cached.get(hash) {
                    Some(cell) => {
                        dict.set(hash, cell.clone())
                            .map_err(|e| CacheError::internal("failed to build library dict", e))?;
                    }
                    None => missing.push(*hash),
                }
            }
        }
        if missing.is_empty() {
            return Ok((dict, true));
        }

        missing.sort_unstable();
        missing.dedup();
        let inner = self.inner.clone();
        let to_fetch = missing.clone();
        let (res, _) = self
            .inner
            .library_flights
            .run(missing, move || async move { Inner::fetch_libraries(inner, to_fetch).await })
            .await;
        for (hash, cell) in res?.iter() {
            dict.set(hash, cell.clone())
                .map_err(|e| CacheError::internal("failed to build library dict", e))?;
        }
        Ok((dict, false))
    }

    /// The zero state captured at the first masterchain-info resolution.
    pub fn zero_state(&self) -> Result<proto::ZeroStateIdExt, CacheError> {
        match self.inner.zero_state.load_full() {
            Some(zero) => Ok(*zero),
            None => Err(CacheError::internal(
                "zero state",
                anyhow::anyhow!("not initialized yet"),
            )),
        }
    }

    /// Suspends until the masterchain tip reaches `seqno` or the timeout
    /// fires.
    pub async fn wait_master_block(&self, seqno: u32, timeout: Duration) -> Result<(), CacheError> {
        let mut rx = self.inner.tip_tx.subscribe();
        if *rx.borrow() >= seqno {
            return Ok(());
        }
        let waited = tokio::time::timeout(timeout, async move {
            loop {
                if rx.changed().await.is_err() {
                    return Err(CacheError::internal(
                        "wait master block",
                        anyhow::anyhow!("tip tracker is gone"),
                    ));
                }
                if *rx.borrow() >= seqno {
                    return Ok(());
                }
            }
        })
        .await;
        match waited {
            Ok(res) => res,
            Err(_) => Err(LsError::new(
                codes::WAIT_TIMEOUT,
                "timeout waiting for masterchain block",
            )
            .into()),
        }
    }

    /// Current tip seqno, zero before the first master block is known.
    pub fn tip_seqno(&self) -> u32 {
        *self.inner.tip_tx.borrow()
    }

    pub(crate) fn publish_last(&self, block: Arc<MasterBlock>) -> bool {
        self.inner.publish_last(block)
    }

    pub(crate) fn insert_master(&self, block: Arc<MasterBlock>) {
        self.inner.insert_master(block);
    }

    #[cfg(test)]
    pub(crate) fn set_zero_state(&self, zero: proto::ZeroStateIdExt) {
        self.inner.store_zero_state(zero);
    }

    #[cfg(test)]
    pub(crate) fn seed_account_state(
        &self,
        master: &BlockId,
        addr: &StdAddr,
        state: Arc<proto::AccountState>,
    ) {
        self.inner.accounts.lock().put((*master, addr.clone()), state);
    }

    pub(crate) fn table_sizes(&self) -> [(&'static str, usize); 5] {
        [
            ("masters", self.inner.masters.lock().len()),
            ("blocks", self.inner.blocks.lock().len()),
            ("accounts", self.inner.accounts.lock().len()),
            ("transactions", self.inner.transactions.lock().len()),
            ("libraries", self.inner.libraries.lock().len()),
        ]
    }
}

impl Inner {
    /// Rejects backend replies that do not bind to the requested block id.
    fn check_reply_id(requested: &BlockId, got: &proto::BlockIdExt) -> Result<(), CacheError> {
        let got = got.as_block_id()?;
        if got != *requested {
            return Err(LsError::new(
                codes::BAD_REQUEST,
                "backend replied for a different block",
            )
            .into());
        }
        Ok(())
    }

    async fn fetch_master(inner: Arc<Inner>, id: BlockId) -> Result<Arc<MasterBlock>, CacheError> {
        let req = proto::GetConfigAll { mode: 0, id: proto::BlockIdExt::from(&id) };
        let info: proto::ConfigInfo = backend::query(&*inner.backend, &req).await?;
        Self::check_reply_id(&id, &info.id)?;

        let block = Arc::new(Self::parse_config_proof(id, &info.config_proof)?);
        inner.insert_master(block.clone());
        Ok(block)
    }

    /// Extracts the governance config, shard references, state hash and
    /// generation time from a `getConfigAll` config proof.
    fn parse_config_proof(id: BlockId, config_proof: &[u8]) -> Result<MasterBlock, CacheError> {
        let map = |e: everscale_types::error::Error| CacheError::internal("config proof", e);

        let root = Boc::decode(config_proof)
            .map_err(|e| CacheError::internal("config proof boc", e))?;
        let proof = root.as_ref().parse::<MerkleProof>().map_err(map)?;

        let virt_root = proof.cell.as_ref().virtualize();
        let mut slice = virt_root.as_slice().map_err(map)?;
        let state = ShardStateUnsplit::load_from(&mut slice).map_err(map)?;
        if state.seqno != id.seqno {
            return Err(LsError::new(
                codes::BAD_REQUEST,
                "config proof is for a different seqno",
            )
            .into());
        }
        let custom = state.load_custom().map_err(map)?.ok_or_else(|| {
            CacheError::internal(
                "config proof",
                anyhow::anyhow!("masterchain state has no extra"),
            )
        })?;

        Ok(MasterBlock {
            id,
            gen_utime: state.gen_utime,
            state_hash: proof.hash,
            config: custom.config.params.clone(),
            shard_hashes: custom.shards.clone(),
        })
    }

    async fn fetch_libraries(
        inner: Arc<Inner>,
        hashes: Vec<HashBytes>,
    ) -> Result<Arc<Vec<(HashBytes, Cell)>>, CacheError> {
        let req = proto::GetLibraries {
            library_list: hashes.iter().map(|h| h.0).collect(),
        };
        let resp: proto::LibraryResult = backend::query(&*inner.backend, &req).await?;

        let mut fetched = Vec::with_capacity(resp.result.len());
        for entry in &resp.result {
            let hash = HashBytes(entry.hash);
            let cell = Boc::decode(&entry.data)
                .map_err(|e| CacheError::internal("library cell boc", e))?;
            if *cell.repr_hash() != hash {
                return Err(LsError::new(
                    codes::BAD_REQUEST,
                    "library content does not match its hash",
                )
                .into());
            }
            fetched.push((hash, cell));
        }

        let mut cached = inner.libraries.lock();
        for (hash, cell) in &fetched {
            cached.put(*hash, cell.clone());
        }
        drop(cached);
        Ok(Arc::new(fetched))
    }

    fn store_zero_state(&self, zero: proto::ZeroStateIdExt) {
        if self.zero_state.load().is_none() {
            self.zero_state.store(Some(Arc::new(zero)));
        }
    }

    fn insert_master(&self, block: Arc<MasterBlock>) {
        let mut masters = self.masters.lock();
        let id = block.id;
        masters.put(id, MasterEntry { block, added_at: Instant::now() });

        // Evict beyond capacity, but never inside the retention window;
        // the table may transiently overflow while entries are young.
        while masters.len() > self.config.masters_capacity {
            match masters.peek_lru() {
                Some((_, entry)) if entry.added_at.elapsed() >= self.config.master_retention => {
                    masters.pop_lru();
                }
                _ => break,
            }
        }
    }

    fn publish_last(&self, block: Arc<MasterBlock>) -> bool {
        let _guard = self.tip_lock.lock();
        let seqno = block.id.seqno;
        if let Some(current) = self.last.load_full() {
            if seqno <= current.id.seqno {
                return false;
            }
        }
        self.last.store(Some(block));
        self.tip_tx.send_if_modified(|tip| {
            if seqno > *tip {
                *tip = seqno;
                true
            } else {
                false
            }
        });
        debug!(seqno, "masterchain tip advanced");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockBackend};

    fn cache_with(backend: MockBackend) -> BlockCache {
        BlockCache::new(Arc::new(backend), CacheConfig::default())
    }

    #[tokio::test]
    async fn concurrent_account_misses_share_one_fetch() {
        let master = testing::master_block(100);
        let addr = testing::account_addr(7);
        let reply = testing::account_state_reply(&master.id, vec![1, 2, 3]);

        let backend = MockBackend::replying(move |_| Ok(tl_proto::serialize(&reply)))
            .with_delay(Duration::from_millis(20));
        let calls = backend.calls.clone();
        let cache = cache_with(backend);

        let a = {
            let cache = cache.clone();
            let master = master.clone();
            let addr = addr.clone();
            tokio::spawn(async move { cache.account_state(&master, &addr).await })
        };
        let b = {
            let cache = cache.clone();
            let master = master.clone();
            let addr = addr.clone();
            tokio::spawn(async move { cache.account_state(&master, &addr).await })
        };

        let (state_a, cached_a) = a.await.unwrap().unwrap();
        let (state_b, cached_b) = b.await.unwrap().unwrap();
        assert_eq!(state_a.state, state_b.state);
        assert!(!cached_a);
        assert!(!cached_b);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // after publication the same lookup is a pure cache hit
        let (state_c, cached_c) = cache.account_state(&master, &addr).await.unwrap();
        assert!(cached_c);
        assert_eq!(state_c.state, state_a.state);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatched_reply_id_is_a_validation_error() {
        let id = testing::master_id(5);
        let mut wrong = proto::BlockIdExt::from(&id);
        wrong.root_hash = [0xff; 32];

        let backend = MockBackend::replying(move |_| {
            Ok(tl_proto::serialize(&proto::BlockData { id: wrong, data: vec![9] }))
        });
        let cache = cache_with(backend);

        match cache.block(&id).await {
            Err(CacheError::Ls(err)) => {
                assert_eq!(err.code, codes::BAD_REQUEST);
                assert_eq!(err.message, "backend replied for a different block");
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        // nothing was published
        assert_eq!(cache.table_sizes()[1], ("blocks", 0));
    }

    #[tokio::test]
    async fn backend_ls_errors_pass_through_and_are_not_cached() {
        let id = testing::master_id(5);
        let backend = MockBackend::replying(|_| {
            Ok(tl_proto::serialize(&LsError::new(404, "block not found")))
        });
        let calls = backend.calls.clone();
        let cache = cache_with(backend);

        for _ in 0..2 {
            match cache.block(&id).await {
                Err(CacheError::Ls(err)) => {
                    assert_eq!(err.code, 404);
                    assert_eq!(err.message, "block not found");
                }
                other => panic!("expected ls error, got {other:?}"),
            }
        }
        // the error was never cached, each attempt hit the backend
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn libraries_mix_hits_and_misses() {
        let lib_a = testing::any_cell(1);
        let lib_b = testing::any_cell(2);
        let hash_a = *lib_a.repr_hash();
        let hash_b = *lib_b.repr_hash();

        let reply_b = proto::LibraryResult {
            result: vec![proto::LibraryEntry {
                hash: hash_b.0,
                data: Boc::encode(lib_b.as_ref()),
            }],
        };
        let backend = MockBackend::replying(move |req| {
            let parsed: proto::GetLibraries = tl_proto::deserialize(req).unwrap();
            assert_eq!(parsed.library_list, vec![hash_b.0]);
            Ok(tl_proto::serialize(&reply_b))
        });
        let cache = cache_with(backend);
        cache.inner.libraries.lock().put(hash_a, lib_a.clone());

        let (dict, cached) = cache.libraries(&[hash_a, hash_b]).await.unwrap();
        assert!(!cached);
        assert!(dict.get(&hash_a).unwrap().is_some());
        assert!(dict.get(&hash_b).unwrap().is_some());

        let (_, cached) = cache.libraries(&[hash_a, hash_b]).await.unwrap();
        assert!(cached);
    }

    #[tokio::test]
    async fn library_content_is_verified_against_its_hash() {
        let lib = testing::any_cell(3);
        let backend = MockBackend::replying(move |_| {
            Ok(tl_proto::serialize(&proto::LibraryResult {
                result: vec![proto::LibraryEntry {
                    hash: [0xaa; 32],
                    data: Boc::encode(lib.as_ref()),
                }],
            }))
        });
        let cache = cache_with(backend);

        match cache.libraries(&[HashBytes([0xaa; 32])]).await {
            Err(CacheError::Ls(err)) => assert_eq!(err.code, codes::BAD_REQUEST),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_master_block_times_out_with_ls_error() {
        let cache = cache_with(MockBackend::unreachable());
        cache.publish_last(testing::master_block(10));

        let err = cache
            .wait_master_block(110, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            CacheError::Ls(err) => assert_eq!(err.code, codes::WAIT_TIMEOUT),
            other => panic!("expected timeout, got {other:?}"),
        }
        // the tip did not move
        assert_eq!(cache.tip_seqno(), 10);
    }

    #[tokio::test]
    async fn wait_master_block_wakes_on_publication() {
        let cache = cache_with(MockBackend::unreachable());
        cache.publish_last(testing::master_block(10));

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_master_block(11, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        cache.publish_last(testing::master_block(11));

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn master_eviction_respects_retention_window() {
        let mut config = CacheConfig::default();
        config.masters_capacity = 2;
        config.master_retention = Duration::from_secs(3600);
        let cache = BlockCache::new(Arc::new(MockBackend::unreachable()), config);

        for seqno in 1..=5 {
            cache.insert_master(testing::master_block(seqno));
        }
        // all entries are inside the retention window, none were evicted
        assert_eq!(cache.table_sizes()[0], ("masters", 5));

        let mut config = CacheConfig::default();
        config.masters_capacity = 2;
        config.master_retention = Duration::ZERO;
        let cache = BlockCache::new(Arc::new(MockBackend::unreachable()), config);

        for seqno in 1..=5 {
            cache.insert_master(testing::master_block(seqno));
        }
        assert_eq!(cache.table_sizes()[0], ("masters", 2));
    }

    #[tokio::test]
    async fn zero_state_is_loaded_once() {
        let cache = cache_with(MockBackend::unreachable());
        assert!(cache.zero_state().is_err());

        let zero = proto::ZeroStateIdExt { workchain: -1, root_hash: [1; 32], file_hash: [2; 32] };
        cache.set_zero_state(zero);
        assert_eq!(cache.zero_state().unwrap(), zero);

        // later publications do not overwrite the singleton
        let other = proto::ZeroStateIdExt { workchain: -1, root_hash: [3; 32], file_hash: [4; 32] };
        cache.set_zero_state(other);
        assert_eq!(cache.zero_state().unwrap(), zero);
    }

    #[tokio::test]
    async fn transactions_are_keyed_by_logical_time() {
        let id = testing::master_id(9);
        let addr = testing::account_addr(1);
        let backend = MockBackend::replying(move |req| {
            let parsed: proto::GetOneTransaction = tl_proto::deserialize(req).unwrap();
            Ok(tl_proto::serialize(&proto::TransactionInfo {
                id: parsed.id,
                proof: vec![],
                transaction: parsed.lt.to_le_bytes().to_vec(),
            }))
        });
        let calls = backend.calls.clone();
        let cache = cache_with(backend);

        let (tx1, _) = cache.transaction(&id, &addr, 111).await.unwrap();
        let (tx2, _) = cache.transaction(&id, &addr, 222).await.unwrap();
        assert_ne!(tx1.transaction, tx2.transaction);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        let (tx1_again, cached) = cache.transaction(&id, &addr, 111).await.unwrap();
        assert!(cached);
        assert_eq!(tx1_again.transaction, tx1.transaction);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
