//! Shared mock collaborators and fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use everscale_types::boc::BocRepr;
use everscale_types::cell::{Cell, CellBuilder, CellFamily, HashBytes};
use everscale_types::dict::Dict;
use everscale_types::models::{
    Account, AccountState, BlockId, BlockchainConfigParams, CurrencyCollection, IntAddr,
    OptionalAccount, ShardHashes, ShardIdent, StateInit, StdAddr, StorageInfo, StorageUsed,
};
use parking_lot::Mutex;

use crate::backend::{BackendError, LiteBackend};
use crate::cache::MasterBlock;
use crate::emulate::{EmulateError, MethodEmulator, RunMethodOutput, RunMethodParams};
use crate::proto;

type Handler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, BackendError> + Send + Sync>;

/// A scripted backend: every query goes through one handler closure, with
/// a call counter for at-most-once assertions and an optional delay to
/// hold fetches in flight.
pub(crate) struct MockBackend {
    handler: Handler,
    pub(crate) calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl MockBackend {
    pub(crate) fn replying(
        handler: impl Fn(&[u8]) -> Result<Vec<u8>, BackendError> + Send + Sync + 'static,
    ) -> Self {
        Self { handler: Box::new(handler), calls: Arc::new(AtomicUsize::new(0)), delay: None }
    }

    /// A backend that must never be reached.
    pub(crate) fn unreachable() -> Self {
        Self::replying(|_| panic!("the backend must not be consulted in this test"))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl LiteBackend for MockBackend {
    async fn query_raw(&self, query: &[u8]) -> Result<Vec<u8>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(query)
    }
}

/// The inputs an emulation ran with, kept for assertions.
#[derive(Clone)]
pub(crate) struct CapturedRun {
    pub(crate) method_id: i32,
    pub(crate) balance: u128,
    pub(crate) address: StdAddr,
    pub(crate) now: u32,
    pub(crate) stack: Vec<u8>,
    pub(crate) gas_limit: u64,
}

/// A deterministic emulator double.
pub(crate) struct MockEmulator {
    output: Result<RunMethodOutput, String>,
    pub(crate) captured: Arc<Mutex<Option<CapturedRun>>>,
}

impl MockEmulator {
    pub(crate) fn ok(exit_code: i32, stack: Vec<u8>) -> Self {
        Self {
            output: Ok(RunMethodOutput { exit_code, stack }),
            captured: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn failing(reason: &str) -> Self {
        Self { output: Err(reason.to_string()), captured: Arc::new(Mutex::new(None)) }
    }
}

impl MethodEmulator for MockEmulator {
    fn run_get_method(
        &self,
        method_id: i32,
        params: RunMethodParams,
        gas_limit: u64,
    ) -> Result<RunMethodOutput, EmulateError> {
        *self.captured.lock() = Some(CapturedRun {
            method_id,
            balance: params.balance,
            address: params.address,
            now: params.now,
            stack: params.stack,
            gas_limit,
        });
        match &self.output {
            Ok(output) => Ok(output.clone()),
            Err(reason) => Err(EmulateError::Vm(reason.clone())),
        }
    }
}

pub(crate) fn master_id(seqno: u32) -> BlockId {
    BlockId {
        shard: ShardIdent::MASTERCHAIN,
        seqno,
        root_hash: HashBytes([seqno as u8; 32]),
        file_hash: HashBytes([seqno.wrapping_add(1) as u8; 32]),
    }
}

pub(crate) fn master_block(seqno: u32) -> Arc<MasterBlock> {
    Arc::new(MasterBlock {
        id: master_id(seqno),
        gen_utime: 1_700_000_000 + seqno,
        state_hash: HashBytes([0x55; 32]),
        config: {
            let mut builder = CellBuilder::new();
            builder.store_reference(Cell::empty_cell()).unwrap();
            builder.build().unwrap().parse::<BlockchainConfigParams>().unwrap()
        },
        shard_hashes: ShardHashes::default(),
    })
}

pub(crate) fn zero_state() -> proto::ZeroStateIdExt {
    proto::ZeroStateIdExt { workchain: -1, root_hash: [0x01; 32], file_hash: [0x02; 32] }
}

pub(crate) fn account_addr(tag: u8) -> StdAddr {
    StdAddr::new(0, HashBytes([tag; 32]))
}

/// A backend-shaped account-state reply bound to the given master block.
pub(crate) fn account_state_reply(master: &BlockId, state: Vec<u8>) -> proto::AccountState {
    let shardblk = BlockId {
        shard: ShardIdent::BASECHAIN,
        seqno: master.seqno * 2,
        root_hash: HashBytes([0x33; 32]),
        file_hash: HashBytes([0x44; 32]),
    };
    proto::AccountState {
        id: proto::BlockIdExt::from(master),
        shardblk: proto::BlockIdExt::from(&shardblk),
        shard_proof: vec![0x51],
        proof: vec![0x52, 0x53],
        state,
    }
}

/// Serializes a deployed account with trivial code and data cells.
pub(crate) fn active_account_boc(addr: &StdAddr, balance: u128) -> Vec<u8> {
    let mut code = CellBuilder::new();
    code.store_u32(0xc0de_c0de).unwrap();
    let code = code.build().unwrap();

    let mut data = CellBuilder::new();
    data.store_u64(0xda1a_0000_0000_0001).unwrap();
    let data = data.build().unwrap();

    let account = Account {
        address: IntAddr::Std(addr.clone()),
        storage_stat: StorageInfo { used: StorageUsed::ZERO, last_paid: 0, due_payment: None },
        last_trans_lt: 0,
        balance: CurrencyCollection::new(balance),
        state: AccountState::Active(StateInit {
            split_depth: None,
            special: None,
            code: Some(code),
            data: Some(data),
            libraries: Dict::new(),
        }),
        init_code_hash: None,
    };
    BocRepr::encode(&OptionalAccount(Some(account))).unwrap()
}

/// An arbitrary distinct cell, usable as library content.
pub(crate) fn any_cell(tag: u32) -> Cell {
    let mut b = CellBuilder::new();
    b.store_u32(tag).unwrap();
    b.store_u32(!tag).unwrap();
    b.build().unwrap()
}

pub(crate) fn run_method_query(master: &BlockId, mode: u32) -> proto::RunSmcMethod {
    proto::RunSmcMethod {
        mode,
        id: proto::BlockIdExt::from(master),
        account: proto::AccountId::from(&account_addr(0)),
        method_id: 85143,
        params: vec![],
    }
}

/// A masterchain-info reply describing the given block.
pub(crate) fn masterchain_info_ext(block: &MasterBlock) -> proto::MasterchainInfoExt {
    proto::MasterchainInfoExt {
        mode: 0,
        version: proto::PROTO_VERSION,
        capabilities: proto::PROTO_CAPABILITIES,
        last: proto::BlockIdExt::from(&block.id),
        last_utime: block.gen_utime,
        now: block.gen_utime,
        state_root_hash: block.state_hash.0,
        init: zero_state(),
    }
}
