//! Per-query dispatch: classify, resolve dependencies from the cache,
//! emulate or forward, assemble the typed reply.
//!
//! Three paths:
//! - pure emulation (`getTime`, `getVersion`) answers from local state
//!   alone;
//! - cache-backed handlers resolve their inputs through [`BlockCache`]
//!   and fall back to the backend per miss;
//! - everything else is forwarded verbatim to the backend under a hard
//!   deadline, and the reply is returned byte-for-byte.
//!
//! Every reply is classified for metrics: how it was produced and whether
//! it failed on validation or internally.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use everscale_types::boc::Boc;
use everscale_types::cell::{Cell, CellBuilder, HashBytes};
use everscale_types::merkle::MerkleProof;
use everscale_types::models::{AccountState as AccountStateModel, OptionalAccount};
use tracing::{debug, warn};

use crate::backend::{BackendError, LiteBackend};
use crate::cache::{BlockCache, CacheError};
use crate::emulate::{find_libs, MethodEmulator, RunMethodParams};
use crate::proto::{self, codes, LsError, Query};

/// Upstreams are expected to be fast; proxied queries fail over to a 502
/// after this long.
pub const BACKEND_QUERY_TIMEOUT: Duration = Duration::from_secs(7);

/// Gas allowance for a single get-method emulation.
pub const RUN_METHOD_GAS_LIMIT: u64 = 1_000_000;

/// How a reply was produced, used as the `hit` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitType {
    /// Computed locally with every input already cached.
    Emulated,
    /// Served directly from the cache.
    Cache,
    /// The backend was consulted for at least one dependency.
    Backend,
    /// The client input was rejected or a backend error was surfaced.
    FailedValidate,
    /// Rejected because the caller asked for a c7 continuation return.
    FailedValidateWantC7,
    /// Internal failure, answered with a generic 500.
    FailedInternal,
}

impl HitType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emulated => "emulated",
            Self::Cache => "cache",
            Self::Backend => "backend",
            Self::FailedValidate => "failed_validate",
            Self::FailedValidateWantC7 => "failed_validate_want_c7",
            Self::FailedInternal => "failed_internal",
        }
    }
}

/// A typed reply ready for serialization.
#[derive(Debug, Clone)]
pub enum Reply {
    Error(LsError),
    MasterchainInfo(proto::MasterchainInfo),
    MasterchainInfoExt(proto::MasterchainInfoExt),
    CurrentTime(proto::CurrentTime),
    Version(proto::Version),
    Block(Arc<proto::BlockData>),
    Account(Arc<proto::AccountState>),
    Transaction(Arc<proto::TransactionInfo>),
    Libraries(proto::LibraryResult),
    RunMethod(proto::RunMethodResult),
    /// A backend reply forwarded byte-for-byte.
    Raw(Vec<u8>),
}

impl Reply {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Error(v) => tl_proto::serialize(v),
            Self::MasterchainInfo(v) => tl_proto::serialize(v),
            Self::MasterchainInfoExt(v) => tl_proto::serialize(v),
            Self::CurrentTime(v) => tl_proto::serialize(v),
            Self::Version(v) => tl_proto::serialize(v),
            Self::Block(v) => tl_proto::serialize(v.as_ref()),
            Self::Account(v) => tl_proto::serialize(v.as_ref()),
            Self::Transaction(v) => tl_proto::serialize(v.as_ref()),
            Self::Libraries(v) => tl_proto::serialize(v),
            Self::RunMethod(v) => tl_proto::serialize(v),
            Self::Raw(bytes) => bytes.clone(),
        }
    }

    pub fn as_ls_error(&self) -> Option<&LsError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

pub(crate) fn now_sec() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub struct Dispatcher {
    cache: BlockCache,
    backend: Arc<dyn LiteBackend>,
    emulator: Option<Arc<dyn MethodEmulator>>,
}

impl Dispatcher {
    pub fn new(
        cache: BlockCache,
        backend: Arc<dyn LiteBackend>,
        emulator: Option<Arc<dyn MethodEmulator>>,
    ) -> Self {
        Self { cache, backend, emulator }
    }

    /// Handles one classified query. `raw` is the same query in its wire
    /// form, used when it has to be proxied.
    pub async fn dispatch(&self, query: &Query, raw: &[u8]) -> (Reply, HitType) {
        match query {
            Query::Version => (
                Reply::Version(proto::Version {
                    mode: 0,
                    version: proto::PROTO_VERSION,
                    capabilities: proto::PROTO_CAPABILITIES,
                    now: now_sec(),
                }),
                HitType::Emulated,
            ),
            Query::Time => {
                (Reply::CurrentTime(proto::CurrentTime { now: now_sec() }), HitType::Emulated)
            }
            Query::MasterchainInfo => self.handle_masterchain_info().await,
            Query::MasterchainInfoExt(q) => self.handle_masterchain_info_ext(q).await,
            Query::BlockData(q) => self.handle_block(q).await,
            Query::AccountState(q) => self.handle_account(q).await,
            Query::Transaction(q) => self.handle_transaction(q).await,
            Query::Libraries(q) => self.handle_libraries(q).await,
            Query::RunMethod(q) if self.emulator.is_some() => self.handle_run_method(q).await,
            // without a linked vm the method run is the backend's problem
            Query::RunMethod(_) | Query::Other { .. } => self.forward(raw).await,
        }
    }

    /// Opaque proxy path: the query goes to the backend verbatim and the
    /// reply comes back verbatim.
    pub async fn forward(&self, raw: &[u8]) -> (Reply, HitType) {
        debug!("direct proxy");
        let result = tokio::time::timeout(BACKEND_QUERY_TIMEOUT, self.backend.query_raw(raw)).await;
        match result {
            Ok(Ok(reply)) => {
                if proto::read_tl_id(&reply) == Some(LsError::TL_ID) {
                    if let Ok(err) = tl_proto::deserialize::<LsError>(&reply) {
                        return (Reply::Error(err), HitType::FailedValidate);
                    }
                }
                (Reply::Raw(reply), HitType::Backend)
            }
            Ok(Err(BackendError::Ls(err))) => (Reply::Error(err), HitType::FailedValidate),
            Ok(Err(err)) => {
                warn!(error = %err, "backend query failed");
                (
                    Reply::Error(LsError::new(codes::BACKEND_TIMEOUT, "backend node timeout")),
                    HitType::FailedInternal,
                )
            }
            Err(_) => (
                Reply::Error(LsError::new(codes::BACKEND_TIMEOUT, "backend node timeout")),
                HitType::FailedInternal,
            ),
        }
    }

    async fn handle_masterchain_info(&self) -> (Reply, HitType) {
        let (block, cached) = match self.cache.last_master_block().await {
            Ok(v) => v,
            Err(e) => {
                return fail(e, "GetMasterchainInfo", "failed to resolve master block",
                    HitType::FailedInternal)
            }
        };
        let zero = match self.cache.zero_state() {
            Ok(zero) => zero,
            Err(e) => {
                return fail(e, "GetMasterchainInfo", "failed to resolve zero state",
                    HitType::FailedInternal)
            }
        };
        let hit = if cached { HitType::Cache } else { HitType::Backend };
        (
            Reply::MasterchainInfo(proto::MasterchainInfo {
                last: proto::BlockIdExt::from(&block.id),
                state_root_hash: block.state_hash.0,
                init: zero,
            }),
            hit,
        )
    }

    async fn handle_masterchain_info_ext(
        &self,
        q: &proto::GetMasterchainInfoExt,
    ) -> (Reply, HitType) {
        if q.mode != 0 {
            return (
                Reply::Error(LsError::new(codes::BAD_REQUEST, "non zero mode is not supported")),
                HitType::FailedValidate,
            );
        }
        let (block, cached) = match self.cache.last_master_block().await {
            Ok(v) => v,
            Err(e) => {
                return fail(e, "GetMasterchainInfoExt", "failed to resolve master block",
                    HitType::FailedInternal)
            }
        };
        let zero = match self.cache.zero_state() {
            Ok(zero) => zero,
            Err(e) => {
                return fail(e, "GetMasterchainInfoExt", "failed to resolve zero state",
                    HitType::FailedInternal)
            }
        };
        let hit = if cached { HitType::Cache } else { HitType::Backend };
        (
            Reply::MasterchainInfoExt(proto::MasterchainInfoExt {
                mode: q.mode,
                version: proto::PROTO_VERSION,
                capabilities: proto::PROTO_CAPABILITIES,
                last: proto::BlockIdExt::from(&block.id),
                last_utime: block.gen_utime,
                now: now_sec(),
                state_root_hash: block.state_hash.0,
                init: zero,
            }),
            hit,
        )
    }

    async fn handle_block(&self, q: &proto::GetBlockData) -> (Reply, HitType) {
        let id = match q.id.as_block_id() {
            Ok(id) => id,
            Err(e) => return (Reply::Error(e), HitType::FailedValidate),
        };
        match self.cache.block(&id).await {
            Ok((data, cached)) => {
                let hit = if cached { HitType::Cache } else { HitType::Backend };
                (Reply::Block(data), hit)
            }
            Err(e) => fail(e, "GetBlockData", "failed to get block", HitType::FailedValidate),
        }
    }

    async fn handle_transaction(&self, q: &proto::GetOneTransaction) -> (Reply, HitType) {
        let id = match q.id.as_block_id() {
            Ok(id) => id,
            Err(e) => return (Reply::Error(e), HitType::FailedValidate),
        };
        let addr = q.account.as_std_addr();
        match self.cache.transaction(&id, &addr, q.lt).await {
            Ok((tx, cached)) => {
                let hit = if cached { HitType::Cache } else { HitType::Backend };
                (Reply::Transaction(tx), hit)
            }
            Err(e) => {
                fail(e, "GetOneTransaction", "failed to get transaction", HitType::FailedValidate)
            }
        }
    }

    async fn handle_account(&self, q: &proto::GetAccountState) -> (Reply, HitType) {
        let id = match q.id.as_block_id() {
            Ok(id) => id,
            Err(e) => return (Reply::Error(e), HitType::FailedValidate),
        };
        let (master, cached_master) = match self.cache.master_block(&id).await {
            Ok(v) => v,
            Err(e) => {
                return fail(e, "GetAccountState", "failed to resolve master block",
                    HitType::FailedValidate)
            }
        };
        let addr = q.account.as_std_addr();
        match self.cache.account_state(&master, &addr).await {
            Ok((state, cached_state)) => {
                let hit = if cached_state && cached_master {
                    HitType::Cache
                } else {
                    HitType::Backend
                };
                (Reply::Account(state), hit)
            }
            Err(e) => {
                fail(e, "GetAccountState", "failed to get account state", HitType::FailedValidate)
            }
        }
    }

    async fn handle_libraries(&self, q: &proto::GetLibraries) -> (Reply, HitType) {
        let hashes: Vec<HashBytes> = q.library_list.iter().copied().map(HashBytes).collect();
        let (libs, cached) = match self.cache.libraries(&hashes).await {
            Ok(v) => v,
            Err(e) => {
                return fail(e, "GetLibraries", "failed to get libraries", HitType::FailedValidate)
            }
        };

        let mut result = Vec::new();
        for entry in libs.iter() {
            match entry {
                Ok((hash, cell)) => result.push(proto::LibraryEntry {
                    hash: hash.0,
                    data: Boc::encode(cell.as_ref()),
                }),
                Err(e) => {
                    return fail(
                        CacheError::internal("library dict", e),
                        "GetLibraries",
                        "failed to load libraries",
                        HitType::FailedValidate,
                    )
                }
            }
        }

        let hit = if cached { HitType::Cache } else { HitType::Backend };
        (Reply::Libraries(proto::LibraryResult { result }), hit)
    }

    async fn handle_run_method(&self, q: &proto::RunSmcMethod) -> (Reply, HitType) {
        if q.mode & proto::RunSmcMethod::MODE_INIT_C7 != 0 {
            return (
                Reply::Error(LsError::new(
                    codes::MODE_NOT_SUPPORTED,
                    "c7 return is currently not supported",
                )),
                HitType::FailedValidateWantC7,
            );
        }
        let Some(emulator) = self.emulator.as_deref() else {
            // guarded by the caller
            return (
                Reply::Error(LsError::new(codes::INTERNAL, "method emulation is not available")),
                HitType::FailedInternal,
            );
        };

        let id = match q.id.as_block_id() {
            Ok(id) => id,
            Err(e) => return (Reply::Error(e), HitType::FailedValidate),
        };
        let (master, cached_master) = match self.cache.master_block(&id).await {
            Ok(v) => v,
            Err(e) => {
                return fail(e, "RunSmcMethod", "failed to resolve master block",
                    HitType::FailedValidate)
            }
        };

        let addr = q.account.as_std_addr();
        let (state, cached_state) = match self.cache.account_state(&master, &addr).await {
            Ok(v) => v,
            Err(e) => {
                return fail(e, "RunSmcMethod", "failed to get account state",
                    HitType::FailedValidate)
            }
        };
        if state.state.is_empty() {
            return (
                Reply::Error(LsError::new(
                    codes::CONTRACT_NOT_INITIALIZED,
                    "contract is not initialized",
                )),
                HitType::FailedValidate,
            );
        }

        let account = match parse_active_account(&state.state) {
            Ok(Some(account)) => account,
            Ok(None) => {
                return (
                    Reply::Error(LsError::new(
                        codes::CONTRACT_NOT_INITIALIZED,
                        "contract is not initialized",
                    )),
                    HitType::FailedValidate,
                )
            }
            Err(e) => {
                warn!(error = %e, "failed to parse account state");
                return (
                    Reply::Error(LsError::new(
                        codes::INTERNAL,
                        format!("failed to parse account state: {e}"),
                    )),
                    HitType::FailedInternal,
                );
            }
        };

        let lib_hashes = find_libs(account.code.as_ref());
        let (libraries, cached_libs) = match self.cache.libraries(&lib_hashes).await {
            Ok(v) => v,
            Err(e) => {
                return fail(e, "RunSmcMethod", "failed to resolve libraries",
                    HitType::FailedValidate)
            }
        };

        let output = emulator.run_get_method(
            q.method_id as i32,
            RunMethodParams {
                code: account.code,
                data: account.data,
                address: addr,
                stack: q.params.clone(),
                balance: account.balance,
                libraries,
                config: master.config.clone(),
                now: now_sec(),
            },
            RUN_METHOD_GAS_LIMIT,
        );
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "failed to emulate get method");
                return (
                    Reply::Error(LsError::new(
                        codes::INTERNAL,
                        format!("failed to emulate run method: {e}"),
                    )),
                    HitType::FailedInternal,
                );
            }
        };

        let state_proof = if q.mode & proto::RunSmcMethod::MODE_STATE_PROOF != 0 {
            match build_state_proof(&state.state) {
                Ok(proof) => Some(proof),
                Err(e) => {
                    warn!(error = %e, "failed to prepare state proof");
                    return (
                        Reply::Error(LsError::new(
                            codes::INTERNAL,
                            format!("failed to prepare state proof: {e}"),
                        )),
                        HitType::FailedInternal,
                    );
                }
            }
        } else {
            None
        };

        let mut hit = HitType::Backend;
        if cached_master && cached_libs {
            hit = HitType::Emulated;
            if cached_state {
                hit = HitType::Cache;
            }
        }

        let with_proofs = q.mode & proto::RunSmcMethod::MODE_PROOFS != 0;
        (
            Reply::RunMethod(proto::RunMethodResult {
                mode: q.mode,
                id: q.id,
                shardblk: state.shardblk,
                shard_proof: with_proofs.then(|| state.shard_proof.clone()),
                proof: with_proofs.then(|| state.proof.clone()),
                state_proof,
                init_c7: None,
                lib_extras: None,
                exit_code: output.exit_code,
                result: (q.mode & proto::RunSmcMethod::MODE_RESULT != 0).then_some(output.stack),
            }),
            hit,
        )
    }
}

/// Maps a cache error to a reply: typed errors are forwarded verbatim,
/// everything else is logged and replaced by a generic 500.
fn fail(
    err: CacheError,
    request: &'static str,
    context: &'static str,
    ls_hit: HitType,
) -> (Reply, HitType) {
    match err {
        CacheError::Ls(ls) => (Reply::Error(ls), ls_hit),
        other => {
            warn!(request, error = %other, "{context}");
            (Reply::Error(LsError::new(codes::INTERNAL, context)), HitType::FailedInternal)
        }
    }
}

struct ActiveAccount {
    code: Cell,
    data: Cell,
    balance: u128,
}

/// Parses a state BOC into the pieces emulation needs. `Ok(None)` means
/// the account exists on the wire but carries no runnable state.
fn parse_active_account(state_boc: &[u8]) -> anyhow::Result<Option<ActiveAccount>> {
    let cell = Boc::decode(state_boc)?;
    let OptionalAccount(account) = cell.as_ref().parse::<OptionalAccount>()?;
    let Some(account) = account else {
        return Ok(None);
    };
    let AccountStateModel::Active(state_init) = account.state else {
        return Ok(None);
    };
    let (Some(code), Some(data)) = (state_init.code, state_init.data) else {
        anyhow::bail!("active account without code or data");
    };
    Ok(Some(ActiveAccount {
        code,
        data,
        balance: account.balance.tokens.into_inner(),
    }))
}

/// Minimal Merkle skeleton over the account-state root: the root is kept,
/// its subtrees are pruned, and a verifier can still bind the reply to the
/// proof chain of the enclosing response.
fn build_state_proof(state_boc: &[u8]) -> anyhow::Result<Vec<u8>> {
    let root = Boc::decode(state_boc)?;
    let proof = MerkleProof::create_for_cell(root.as_ref(), root.repr_hash()).build()?;
    let cell = CellBuilder::build_from(proof)?;
    Ok(Boc::encode(cell.as_ref()))
}
