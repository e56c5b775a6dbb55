//! Wire types for the subset of the light-server TL schema the proxy
//! understands.
//!
//! Constructor ids are the CRC32 ids of the canonical `lite_api.tl`
//! definitions (the TL line is quoted above each type). Queries the proxy
//! does not interpret are classified as [`Query::Other`] and forwarded to
//! a backend as raw bytes, so only the cached/emulated subset needs typed
//! representations here.
//!
//! The protocol reports `version = 0x101` and `capabilities = 7`.

use std::fmt;

use everscale_types::cell::HashBytes;
use everscale_types::models::{BlockId, ShardIdent, StdAddr};
use tl_proto::{TlError, TlPacket, TlRead, TlResult, TlWrite};

pub const PROTO_VERSION: u32 = 0x101;
pub const PROTO_CAPABILITIES: u64 = 7;

/// Error codes used on the wire.
pub mod codes {
    pub const BAD_REQUEST: i32 = 400;
    pub const UNKNOWN_KEY: i32 = 401;
    pub const MODE_NOT_SUPPORTED: i32 = 403;
    pub const TOO_MANY_REQUESTS: i32 = 429;
    pub const INTERNAL: i32 = 500;
    pub const BACKEND_TIMEOUT: i32 = 502;
    pub const CONTRACT_NOT_INITIALIZED: i32 = 651;
    pub const WAIT_TIMEOUT: i32 = 652;
}

/// TL constructor ids of every schema line the proxy can name.
pub mod ids {
    pub const MESSAGE_QUERY: u32 = 0xb48bf97a;
    pub const MESSAGE_ANSWER: u32 = 0x0fac8416;
    pub const TCP_PING: u32 = 0x4d082b9a;
    pub const TCP_PONG: u32 = 0xdc69fb03;

    pub const ERROR: u32 = 0xbba9e148;
    pub const LITE_QUERY: u32 = 0x798c06df;
    pub const WAIT_MASTERCHAIN_SEQNO: u32 = 0xbaeab892;

    pub const GET_MASTERCHAIN_INFO: u32 = 0x89b5e62e;
    pub const GET_MASTERCHAIN_INFO_EXT: u32 = 0x70a671df;
    pub const GET_TIME: u32 = 0x16ad5a34;
    pub const GET_VERSION: u32 = 0x232b940b;
    pub const GET_BLOCK: u32 = 0x6377cf0d;
    pub const GET_ACCOUNT_STATE: u32 = 0x6b890e25;
    pub const RUN_SMC_METHOD: u32 = 0x5cc65dd2;
    pub const GET_ONE_TRANSACTION: u32 = 0xd40f24ea;
    pub const GET_LIBRARIES: u32 = 0x7e1e1899;
    pub const GET_CONFIG_ALL: u32 = 0x911b26b7;
    pub const GET_CONFIG_PARAMS: u32 = 0x9ef88d63;
    pub const GET_BLOCK_PROOF: u32 = 0x8aea9c44;
    pub const GET_BLOCK_HEADER: u32 = 0x21ec069e;
    pub const LOOKUP_BLOCK: u32 = 0xfac8f71e;
    pub const GET_ALL_SHARDS_INFO: u32 = 0x74d3fd6b;
    pub const LIST_BLOCK_TRANSACTIONS: u32 = 0xadfcc7da;
    pub const LIST_BLOCK_TRANSACTIONS_EXT: u32 = 0x0079dd5c;
    pub const SEND_MESSAGE: u32 = 0x690ad482;
    pub const GET_SHARD_INFO: u32 = 0x46a2f425;
    pub const GET_TRANSACTIONS: u32 = 0x1c40e7a1;

    pub const MASTERCHAIN_INFO: u32 = 0x85832881;
    pub const MASTERCHAIN_INFO_EXT: u32 = 0xa8cce0f5;
    pub const CURRENT_TIME: u32 = 0xe953000d;
    pub const VERSION: u32 = 0x5a0491e5;
    pub const BLOCK_DATA: u32 = 0xa574ed6c;
    pub const ACCOUNT_STATE: u32 = 0x7079c751;
    pub const RUN_METHOD_RESULT: u32 = 0xa39a616b;
    pub const TRANSACTION_INFO: u32 = 0x0edeed47;
    pub const CONFIG_INFO: u32 = 0xae7b272f;
    pub const LIBRARY_RESULT: u32 = 0x8b84430c;

    pub const PUB_ED25519: u32 = 0x4813b4c6;
}

/// Reads the leading boxed constructor id of a TL payload.
pub fn read_tl_id(data: &[u8]) -> Option<u32> {
    let bytes = data.get(..4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Serializes a zero-argument boxed constructor such as
/// `liteServer.getTime` or `liteServer.getVersion`.
pub fn serialize_id_only(id: u32) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

/// `liteServer.error code:int message:string = liteServer.Error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsError {
    pub code: i32,
    pub message: String,
}

impl LsError {
    pub const TL_ID: u32 = ids::ERROR;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for LsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "liteserver error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for LsError {}

impl TlWrite for LsError {
    type Repr = tl_proto::Boxed;

    fn max_size_hint(&self) -> usize {
        4 + self.code.max_size_hint() + self.message.as_bytes().max_size_hint()
    }

    fn write_to<P: TlPacket>(&self, packet: &mut P) {
        packet.write_u32(Self::TL_ID);
        self.code.write_to(packet);
        self.message.as_bytes().write_to(packet);
    }
}

impl<'a> TlRead<'a> for LsError {
    type Repr = tl_proto::Boxed;

    fn read_from(packet: &'a [u8], offset: &mut usize) -> TlResult<Self> {
        if u32::read_from(packet, offset)? != Self::TL_ID {
            return Err(TlError::UnknownConstructor);
        }
        let code = i32::read_from(packet, offset)?;
        let message = <&[u8]>::read_from(packet, offset)?;
        Ok(Self { code, message: String::from_utf8_lossy(message).into_owned() })
    }
}

/// `tonNode.blockIdExt workchain:int shard:long seqno:int root_hash:int256
/// file_hash:int256 = tonNode.BlockIdExt`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
pub struct BlockIdExt {
    pub workchain: i32,
    pub shard: u64,
    pub seqno: u32,
    pub root_hash: [u8; 32],
    pub file_hash: [u8; 32],
}

impl BlockIdExt {
    /// Converts the wire form into a validated [`BlockId`].
    pub fn as_block_id(&self) -> Result<BlockId, LsError> {
        let shard = ShardIdent::new(self.workchain, self.shard)
            .ok_or_else(|| LsError::new(codes::BAD_REQUEST, "invalid shard ident"))?;
        Ok(BlockId {
            shard,
            seqno: self.seqno,
            root_hash: HashBytes(self.root_hash),
            file_hash: HashBytes(self.file_hash),
        })
    }
}

impl From<&BlockId> for BlockIdExt {
    fn from(id: &BlockId) -> Self {
        Self {
            workchain: id.shard.workchain(),
            shard: id.shard.prefix(),
            seqno: id.seqno,
            root_hash: id.root_hash.0,
            file_hash: id.file_hash.0,
        }
    }
}

/// `tonNode.zeroStateIdExt workchain:int root_hash:int256 file_hash:int256 =
/// tonNode.ZeroStateIdExt`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
pub struct ZeroStateIdExt {
    pub workchain: i32,
    pub root_hash: [u8; 32],
    pub file_hash: [u8; 32],
}

/// `liteServer.accountId workchain:int id:int256 = liteServer.AccountId`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
pub struct AccountId {
    pub workchain: i32,
    pub id: [u8; 32],
}

impl AccountId {
    pub fn as_std_addr(&self) -> StdAddr {
        StdAddr::new(self.workchain as i8, HashBytes(self.id))
    }
}

impl From<&StdAddr> for AccountId {
    fn from(addr: &StdAddr) -> Self {
        Self { workchain: addr.workchain as i32, id: addr.address.0 }
    }
}

// === ADNL envelope ===

/// `adnl.message.query query_id:int256 query:bytes = adnl.Message`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xb48bf97a)]
pub struct MessageQuery {
    pub query_id: [u8; 32],
    pub query: Vec<u8>,
}

/// `adnl.message.answer query_id:int256 answer:bytes = adnl.Message`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x0fac8416)]
pub struct MessageAnswer {
    pub query_id: [u8; 32],
    pub answer: Vec<u8>,
}

/// `tcp.ping random_id:long = tcp.Pong`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x4d082b9a)]
pub struct TcpPing {
    pub random_id: u64,
}

/// `tcp.pong random_id:long = tcp.Pong`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xdc69fb03)]
pub struct TcpPong {
    pub random_id: u64,
}

/// `liteServer.query data:bytes = Object`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x798c06df)]
pub struct LiteQuery {
    pub data: Vec<u8>,
}

/// `liteServer.waitMasterchainSeqno seqno:int timeout_ms:int = Object`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xbaeab892)]
pub struct WaitMasterchainSeqno {
    pub seqno: u32,
    pub timeout_ms: u32,
}

// === Queries ===

/// `liteServer.getMasterchainInfoExt mode:# = liteServer.MasterchainInfoExt`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x70a671df)]
pub struct GetMasterchainInfoExt {
    pub mode: u32,
}

/// `liteServer.getBlock id:tonNode.blockIdExt = liteServer.BlockData`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x6377cf0d)]
pub struct GetBlockData {
    pub id: BlockIdExt,
}

/// `liteServer.getAccountState id:tonNode.blockIdExt
/// account:liteServer.accountId = liteServer.AccountState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x6b890e25)]
pub struct GetAccountState {
    pub id: BlockIdExt,
    pub account: AccountId,
}

/// `liteServer.runSmcMethod mode:# id:tonNode.blockIdExt
/// account:liteServer.accountId method_id:long params:bytes =
/// liteServer.RunMethodResult`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x5cc65dd2)]
pub struct RunSmcMethod {
    pub mode: u32,
    pub id: BlockIdExt,
    pub account: AccountId,
    pub method_id: u64,
    pub params: Vec<u8>,
}

impl RunSmcMethod {
    pub const MODE_PROOFS: u32 = 1 << 0;
    pub const MODE_STATE_PROOF: u32 = 1 << 1;
    pub const MODE_RESULT: u32 = 1 << 2;
    pub const MODE_INIT_C7: u32 = 1 << 3;
    pub const MODE_LIB_EXTRAS: u32 = 1 << 4;
}

/// `liteServer.getOneTransaction id:tonNode.blockIdExt
/// account:liteServer.accountId lt:long = liteServer.TransactionInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xd40f24ea)]
pub struct GetOneTransaction {
    pub id: BlockIdExt,
    pub account: AccountId,
    pub lt: u64,
}

/// `liteServer.getLibraries library_list:(vector int256) =
/// liteServer.LibraryResult`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x7e1e1899)]
pub struct GetLibraries {
    pub library_list: Vec<[u8; 32]>,
}

/// `liteServer.getConfigAll mode:# id:tonNode.blockIdExt =
/// liteServer.ConfigInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x911b26b7)]
pub struct GetConfigAll {
    pub mode: u32,
    pub id: BlockIdExt,
}

// === Responses ===

/// `liteServer.masterchainInfo last:tonNode.blockIdExt state_root_hash:int256
/// init:tonNode.zeroStateIdExt = liteServer.MasterchainInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x85832881)]
pub struct MasterchainInfo {
    pub last: BlockIdExt,
    pub state_root_hash: [u8; 32],
    pub init: ZeroStateIdExt,
}

/// `liteServer.masterchainInfoExt mode:# version:int capabilities:long
/// last:tonNode.blockIdExt last_utime:int now:int state_root_hash:int256
/// init:tonNode.zeroStateIdExt = liteServer.MasterchainInfoExt`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xa8cce0f5)]
pub struct MasterchainInfoExt {
    pub mode: u32,
    pub version: u32,
    pub capabilities: u64,
    pub last: BlockIdExt,
    pub last_utime: u32,
    pub now: u32,
    pub state_root_hash: [u8; 32],
    pub init: ZeroStateIdExt,
}

/// `liteServer.currentTime now:int = liteServer.CurrentTime`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xe953000d)]
pub struct CurrentTime {
    pub now: u32,
}

/// `liteServer.version mode:# version:int capabilities:long now:int =
/// liteServer.Version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x5a0491e5)]
pub struct Version {
    pub mode: u32,
    pub version: u32,
    pub capabilities: u64,
    pub now: u32,
}

/// `liteServer.blockData id:tonNode.blockIdExt data:bytes =
/// liteServer.BlockData`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xa574ed6c)]
pub struct BlockData {
    pub id: BlockIdExt,
    pub data: Vec<u8>,
}

/// `liteServer.accountState id:tonNode.blockIdExt shardblk:tonNode.blockIdExt
/// shard_proof:bytes proof:bytes state:bytes = liteServer.AccountState`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x7079c751)]
pub struct AccountState {
    pub id: BlockIdExt,
    pub shardblk: BlockIdExt,
    pub shard_proof: Vec<u8>,
    pub proof: Vec<u8>,
    pub state: Vec<u8>,
}

/// `liteServer.transactionInfo id:tonNode.blockIdExt proof:bytes
/// transaction:bytes = liteServer.TransactionInfo`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x0edeed47)]
pub struct TransactionInfo {
    pub id: BlockIdExt,
    pub proof: Vec<u8>,
    pub transaction: Vec<u8>,
}

/// `liteServer.configInfo mode:# id:tonNode.blockIdExt state_proof:bytes
/// config_proof:bytes = liteServer.ConfigInfo`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xae7b272f)]
pub struct ConfigInfo {
    pub mode: u32,
    pub id: BlockIdExt,
    pub state_proof: Vec<u8>,
    pub config_proof: Vec<u8>,
}

/// `liteServer.libraryEntry hash:int256 data:bytes = liteServer.LibraryEntry`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
pub struct LibraryEntry {
    pub hash: [u8; 32],
    pub data: Vec<u8>,
}

/// `liteServer.libraryResult result:(vector liteServer.libraryEntry) =
/// liteServer.LibraryResult`
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x8b84430c)]
pub struct LibraryResult {
    pub result: Vec<LibraryEntry>,
}

/// `liteServer.runMethodResult mode:# id:tonNode.blockIdExt
/// shardblk:tonNode.blockIdExt shard_proof:mode.0?bytes proof:mode.0?bytes
/// state_proof:mode.1?bytes init_c7:mode.3?bytes lib_extras:mode.4?bytes
/// exit_code:int result:mode.2?bytes = liteServer.RunMethodResult`
///
/// Serialized by hand because of the mode-conditional fields. Optional
/// fields must be populated exactly per the corresponding mode bits.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunMethodResult {
    pub mode: u32,
    pub id: BlockIdExt,
    pub shardblk: BlockIdExt,
    pub shard_proof: Option<Vec<u8>>,
    pub proof: Option<Vec<u8>>,
    pub state_proof: Option<Vec<u8>>,
    pub init_c7: Option<Vec<u8>>,
    pub lib_extras: Option<Vec<u8>>,
    pub exit_code: i32,
    pub result: Option<Vec<u8>>,
}

impl RunMethodResult {
    pub const TL_ID: u32 = ids::RUN_METHOD_RESULT;
}

fn opt_bytes_size(value: &Option<Vec<u8>>) -> usize {
    value.as_ref().map_or(0, |v| v.as_slice().max_size_hint())
}

fn write_opt_bytes<P: TlPacket>(value: &Option<Vec<u8>>, set: bool, packet: &mut P) {
    if set {
        value.as_deref().unwrap_or_default().write_to(packet);
    }
}

fn read_opt_bytes<'a>(
    set: bool,
    packet: &'a [u8],
    offset: &mut usize,
) -> TlResult<Option<Vec<u8>>> {
    if set {
        Ok(Some(<&[u8]>::read_from(packet, offset)?.to_vec()))
    } else {
        Ok(None)
    }
}

impl TlWrite for RunMethodResult {
    type Repr = tl_proto::Boxed;

    fn max_size_hint(&self) -> usize {
        4 + 4
            + self.id.max_size_hint()
            + self.shardblk.max_size_hint()
            + opt_bytes_size(&self.shard_proof)
            + opt_bytes_size(&self.proof)
            + opt_bytes_size(&self.state_proof)
            + opt_bytes_size(&self.init_c7)
            + opt_bytes_size(&self.lib_extras)
            + 4
            + opt_bytes_size(&self.result)
    }

    fn write_to<P: TlPacket>(&self, packet: &mut P) {
        packet.write_u32(Self::TL_ID);
        self.mode.write_to(packet);
        self.id.write_to(packet);
        self.shardblk.write_to(packet);
        write_opt_bytes(&self.shard_proof, self.mode & RunSmcMethod::MODE_PROOFS != 0, packet);
        write_opt_bytes(&self.proof, self.mode & RunSmcMethod::MODE_PROOFS != 0, packet);
        write_opt_bytes(&self.state_proof, self.mode & RunSmcMethod::MODE_STATE_PROOF != 0, packet);
        write_opt_bytes(&self.init_c7, self.mode & RunSmcMethod::MODE_INIT_C7 != 0, packet);
        write_opt_bytes(&self.lib_extras, self.mode & RunSmcMethod::MODE_LIB_EXTRAS != 0, packet);
        self.exit_code.write_to(packet);
        write_opt_bytes(&self.result, self.mode & RunSmcMethod::MODE_RESULT != 0, packet);
    }
}

impl<'a> TlRead<'a> for RunMethodResult {
    type Repr = tl_proto::Boxed;

    fn read_from(packet: &'a [u8], offset: &mut usize) -> TlResult<Self> {
        if u32::read_from(packet, offset)? != Self::TL_ID {
            return Err(TlError::UnknownConstructor);
        }
        let mode = u32::read_from(packet, offset)?;
        let id = BlockIdExt::read_from(packet, offset)?;
        let shardblk = BlockIdExt::read_from(packet, offset)?;
        let shard_proof = read_opt_bytes(mode & RunSmcMethod::MODE_PROOFS != 0, packet, offset)?;
        let proof = read_opt_bytes(mode & RunSmcMethod::MODE_PROOFS != 0, packet, offset)?;
        let state_proof =
            read_opt_bytes(mode & RunSmcMethod::MODE_STATE_PROOF != 0, packet, offset)?;
        let init_c7 = read_opt_bytes(mode & RunSmcMethod::MODE_INIT_C7 != 0, packet, offset)?;
        let lib_extras = read_opt_bytes(mode & RunSmcMethod::MODE_LIB_EXTRAS != 0, packet, offset)?;
        let exit_code = i32::read_from(packet, offset)?;
        let result = read_opt_bytes(mode & RunSmcMethod::MODE_RESULT != 0, packet, offset)?;
        Ok(Self {
            mode,
            id,
            shardblk,
            shard_proof,
            proof,
            state_proof,
            init_c7,
            lib_extras,
            exit_code,
            result,
        })
    }
}

// === Inbound classification ===

/// A decoded transport-level message.
#[derive(Debug, Clone)]
pub enum Inbound {
    Query(MessageQuery),
    Ping(TcpPing),
}

/// Parses an ADNL message frame. Anything that is not a query or a ping is
/// a protocol error and bubbles up to the transport.
pub fn parse_inbound(data: &[u8]) -> Result<Inbound, ProtoError> {
    match read_tl_id(data) {
        Some(ids::MESSAGE_QUERY) => {
            Ok(Inbound::Query(tl_proto::deserialize(data).map_err(|_| ProtoError::Malformed)?))
        }
        Some(ids::TCP_PING) => {
            Ok(Inbound::Ping(tl_proto::deserialize(data).map_err(|_| ProtoError::Malformed)?))
        }
        Some(id) => Err(ProtoError::UnexpectedMessage(id)),
        None => Err(ProtoError::Malformed),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed message")]
    Malformed,
    #[error("unexpected message constructor {0:#010x}")]
    UnexpectedMessage(u32),
}

/// A classified light-server query.
///
/// Every supported query gets its own arm; everything else lands in
/// [`Query::Other`] and is proxied as raw bytes.
#[derive(Debug, Clone)]
pub enum Query {
    MasterchainInfo,
    MasterchainInfoExt(GetMasterchainInfoExt),
    Time,
    Version,
    BlockData(GetBlockData),
    AccountState(GetAccountState),
    RunMethod(RunSmcMethod),
    Transaction(GetOneTransaction),
    Libraries(GetLibraries),
    Other { kind: &'static str },
}

impl Query {
    /// Classifies a raw query payload.
    pub fn parse(data: &[u8]) -> Result<Self, LsError> {
        fn de<'a, T: TlRead<'a, Repr = tl_proto::Boxed>>(data: &'a [u8]) -> Result<T, LsError> {
            tl_proto::deserialize(data)
                .map_err(|_| LsError::new(codes::BAD_REQUEST, "malformed query"))
        }

        let id = read_tl_id(data)
            .ok_or_else(|| LsError::new(codes::BAD_REQUEST, "empty query"))?;
        Ok(match id {
            ids::GET_MASTERCHAIN_INFO => Self::MasterchainInfo,
            ids::GET_MASTERCHAIN_INFO_EXT => Self::MasterchainInfoExt(de(data)?),
            ids::GET_TIME => Self::Time,
            ids::GET_VERSION => Self::Version,
            ids::GET_BLOCK => Self::BlockData(de(data)?),
            ids::GET_ACCOUNT_STATE => Self::AccountState(de(data)?),
            ids::RUN_SMC_METHOD => Self::RunMethod(de(data)?),
            ids::GET_ONE_TRANSACTION => Self::Transaction(de(data)?),
            ids::GET_LIBRARIES => Self::Libraries(de(data)?),
            other => Self::Other { kind: query_kind(other) },
        })
    }

    /// Stable name used as the metric label for this query.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MasterchainInfo => "GetMasterchainInfo",
            Self::MasterchainInfoExt(_) => "GetMasterchainInfoExt",
            Self::Time => "GetTime",
            Self::Version => "GetVersion",
            Self::BlockData(_) => "GetBlockData",
            Self::AccountState(_) => "GetAccountState",
            Self::RunMethod(_) => "RunSmcMethod",
            Self::Transaction(_) => "GetOneTransaction",
            Self::Libraries(_) => "GetLibraries",
            Self::Other { kind } => kind,
        }
    }
}

/// Maps a constructor id to a metric-friendly query name.
pub fn query_kind(id: u32) -> &'static str {
    match id {
        ids::GET_MASTERCHAIN_INFO => "GetMasterchainInfo",
        ids::GET_MASTERCHAIN_INFO_EXT => "GetMasterchainInfoExt",
        ids::GET_TIME => "GetTime",
        ids::GET_VERSION => "GetVersion",
        ids::GET_BLOCK => "GetBlockData",
        ids::GET_ACCOUNT_STATE => "GetAccountState",
        ids::RUN_SMC_METHOD => "RunSmcMethod",
        ids::GET_ONE_TRANSACTION => "GetOneTransaction",
        ids::GET_LIBRARIES => "GetLibraries",
        ids::GET_CONFIG_ALL => "GetConfigAll",
        ids::GET_CONFIG_PARAMS => "GetConfigParams",
        ids::GET_BLOCK_PROOF => "GetBlockProof",
        ids::GET_BLOCK_HEADER => "GetBlockHeader",
        ids::LOOKUP_BLOCK => "LookupBlock",
        ids::GET_ALL_SHARDS_INFO => "GetAllShardsInfo",
        ids::LIST_BLOCK_TRANSACTIONS => "ListBlockTransactions",
        ids::LIST_BLOCK_TRANSACTIONS_EXT => "ListBlockTransactionsExt",
        ids::SEND_MESSAGE => "SendMessage",
        ids::GET_SHARD_INFO => "GetShardInfo",
        ids::GET_TRANSACTIONS => "GetTransactions",
        ids::WAIT_MASTERCHAIN_SEQNO => "WaitMasterchainSeqno",
        _ => "Unknown",
    }
}

/// Splits an optional `waitMasterchainSeqno` prefix off a query payload.
///
/// The compound form is an ordered pair: the wait directive immediately
/// followed by the inner query. A wait directive with nothing behind it is
/// rejected the same way a malformed pair would be.
pub fn split_wait_prefix(data: &[u8]) -> Result<(Option<WaitMasterchainSeqno>, &[u8]), LsError> {
    if read_tl_id(data) != Some(ids::WAIT_MASTERCHAIN_SEQNO) {
        return Ok((None, data));
    }
    if data.len() < 12 {
        return Err(LsError::new(codes::BAD_REQUEST, "unexpected len of queries"));
    }
    let wait = tl_proto::deserialize::<WaitMasterchainSeqno>(&data[..12])
        .map_err(|_| LsError::new(codes::BAD_REQUEST, "unexpected len of queries"))?;
    let rest = &data[12..];
    if rest.is_empty() {
        return Err(LsError::new(codes::BAD_REQUEST, "unexpected len of queries"));
    }
    Ok((Some(wait), rest))
}

/// Unwraps the `liteServer.query` envelope if present.
pub fn unwrap_lite_query(data: Vec<u8>) -> Result<Vec<u8>, LsError> {
    if read_tl_id(&data) == Some(ids::LITE_QUERY) {
        let wrapped: LiteQuery = tl_proto::deserialize(&data)
            .map_err(|_| LsError::new(codes::BAD_REQUEST, "malformed query"))?;
        Ok(wrapped.data)
    } else {
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block_id() -> BlockIdExt {
        BlockIdExt {
            workchain: -1,
            shard: ShardIdent::PREFIX_FULL,
            seqno: 123,
            root_hash: [0xab; 32],
            file_hash: [0xcd; 32],
        }
    }

    #[test]
    fn ls_error_round_trip() {
        let err = LsError::new(codes::BACKEND_TIMEOUT, "backend node timeout");
        let bytes = tl_proto::serialize(&err);
        assert_eq!(read_tl_id(&bytes), Some(ids::ERROR));
        let parsed: LsError = tl_proto::deserialize(&bytes).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn block_id_conversion_round_trip() {
        let wire = sample_block_id();
        let id = wire.as_block_id().unwrap();
        assert!(id.is_masterchain());
        assert_eq!(BlockIdExt::from(&id), wire);
    }

    #[test]
    fn block_id_rejects_invalid_shard() {
        let mut wire = sample_block_id();
        wire.shard = 0;
        let err = wire.as_block_id().unwrap_err();
        assert_eq!(err.code, codes::BAD_REQUEST);
    }

    #[test]
    fn run_method_result_skips_fields_outside_mode() {
        let full = RunMethodResult {
            mode: 7,
            id: sample_block_id(),
            shardblk: sample_block_id(),
            shard_proof: Some(vec![1, 2, 3]),
            proof: Some(vec![4, 5]),
            state_proof: Some(vec![6]),
            init_c7: None,
            lib_extras: None,
            exit_code: 0,
            result: Some(vec![7, 8, 9, 10]),
        };
        let bytes = tl_proto::serialize(&full);
        let parsed: RunMethodResult = tl_proto::deserialize(&bytes).unwrap();
        assert_eq!(parsed, full);

        let bare = RunMethodResult {
            mode: 0,
            id: sample_block_id(),
            shardblk: sample_block_id(),
            exit_code: -14,
            ..Default::default()
        };
        let bytes = tl_proto::serialize(&bare);
        let parsed: RunMethodResult = tl_proto::deserialize(&bytes).unwrap();
        assert_eq!(parsed.exit_code, -14);
        assert_eq!(parsed.shard_proof, None);
        assert_eq!(parsed.result, None);
    }

    #[test]
    fn classifies_known_and_unknown_queries() {
        let q = tl_proto::serialize(&GetBlockData { id: sample_block_id() });
        assert!(matches!(Query::parse(&q).unwrap(), Query::BlockData(_)));

        let q = tl_proto::serialize(&GetConfigAll { mode: 0, id: sample_block_id() });
        match Query::parse(&q).unwrap() {
            Query::Other { kind } => assert_eq!(kind, "GetConfigAll"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn wait_prefix_is_split_off() {
        let wait = WaitMasterchainSeqno { seqno: 100, timeout_ms: 5000 };
        let inner = tl_proto::serialize(&GetMasterchainInfoExt { mode: 0 });

        let mut compound = tl_proto::serialize(&wait);
        compound.extend_from_slice(&inner);

        let (prefix, rest) = split_wait_prefix(&compound).unwrap();
        assert_eq!(prefix, Some(wait));
        assert_eq!(rest, &inner[..]);

        let (prefix, rest) = split_wait_prefix(&inner).unwrap();
        assert_eq!(prefix, None);
        assert_eq!(rest, &inner[..]);
    }

    #[test]
    fn lone_wait_prefix_is_rejected() {
        let wait = tl_proto::serialize(&WaitMasterchainSeqno { seqno: 1, timeout_ms: 1 });
        let err = split_wait_prefix(&wait).unwrap_err();
        assert_eq!(err.code, codes::BAD_REQUEST);
        assert_eq!(err.message, "unexpected len of queries");
    }

    #[test]
    fn lite_query_envelope_unwraps() {
        let inner = tl_proto::serialize(&GetMasterchainInfoExt { mode: 0 });
        let wrapped = tl_proto::serialize(&LiteQuery { data: inner.clone() });
        assert_eq!(unwrap_lite_query(wrapped).unwrap(), inner);
        assert_eq!(unwrap_lite_query(inner.clone()).unwrap(), inner);
    }
}
