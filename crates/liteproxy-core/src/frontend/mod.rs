//! Session front-end: admission, rate limiting and per-query task spawn.
//!
//! The wire transport delivers decoded frames through [`Frontend::handle_message`]
//! and provides a [`Connection`] handle for sending answers back. Each
//! connection is bound to one server key; the key selects the tenant
//! config with its limiters. A request debits one token from every
//! applicable bucket before its task is spawned, so spikes cannot
//! double-spend capacity. Replies are tagged with the originating query
//! id and may complete in any order.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use everscale_types::cell::HashBytes;
use tracing::debug;

use crate::cache::{BlockCache, CacheError};
use crate::dispatch::{Dispatcher, HitType, Reply};
use crate::limiter::{IpBuckets, LeakyBucket};
use crate::metrics;
use crate::proto::{self, codes, Inbound, LsError, ProtoError};

/// Flat per-query admission cost.
pub const QUERY_COST: u32 = 1;

/// One client connection as seen by the front-end. Implemented by the
/// transport; `send` must not block.
pub trait Connection: Send + Sync + 'static {
    /// Identity of the server key this connection was established with.
    fn server_key(&self) -> &HashBytes;
    fn remote_ip(&self) -> IpAddr;
    /// Queues one serialized ADNL message for sending.
    fn send(&self, frame: Vec<u8>) -> anyhow::Result<()>;
}

/// Tenant configuration selected by a server key.
pub struct KeyConfig {
    name: String,
    per_key: Option<LeakyBucket>,
    per_ip: Option<IpBuckets>,
}

impl KeyConfig {
    pub fn new(
        name: impl Into<String>,
        cooling_per_sec: u32,
        capacity_per_key: u32,
        capacity_per_ip: u32,
    ) -> Self {
        Self {
            name: name.into(),
            per_key: (capacity_per_key > 0)
                .then(|| LeakyBucket::new(cooling_per_sec, capacity_per_key)),
            per_ip: (capacity_per_ip > 0)
                .then(|| IpBuckets::new(cooling_per_sec, capacity_per_ip)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Inner {
    keys: HashMap<HashBytes, KeyConfig, ahash::RandomState>,
    dispatcher: Dispatcher,
    cache: BlockCache,
    only_proxy: bool,
}

/// Shared front-end handle. Cloning is cheap.
#[derive(Clone)]
pub struct Frontend {
    inner: Arc<Inner>,
}

impl Frontend {
    pub fn new(
        keys: impl IntoIterator<Item = (HashBytes, KeyConfig)>,
        dispatcher: Dispatcher,
        cache: BlockCache,
        only_proxy: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                keys: keys.into_iter().collect(),
                dispatcher,
                cache,
                only_proxy,
            }),
        }
    }

    pub fn on_connect(&self, ip: IpAddr) {
        debug!(%ip, "new client connected");
        metrics::connection_opened();
    }

    pub fn on_disconnect(&self, ip: IpAddr) {
        debug!(%ip, "client disconnected");
        metrics::connection_closed();
    }

    /// Entry point for one decoded frame. Errors mean the message did not
    /// even look like the protocol; the transport closes on them.
    ///
    /// An admitted query runs as a detached task whose handle is handed
    /// back to the transport: aborting it on disconnect cancels work owned
    /// by this connection alone, while cache fetches with other attached
    /// waiters keep running.
    pub fn handle_message(
        &self,
        conn: &Arc<dyn Connection>,
        frame: &[u8],
    ) -> Result<Option<tokio::task::JoinHandle<()>>, ProtoError> {
        let key = self.inner.keys.get(conn.server_key());
        let key_name = key.map_or("unknown", |k| k.name.as_str());

        match proto::parse_inbound(frame)? {
            Inbound::Ping(ping) => {
                metrics::record_request(key_name, "TcpPing");
                let pong = proto::TcpPong { random_id: ping.random_id };
                if let Err(e) = conn.send(tl_proto::serialize(&pong)) {
                    debug!(error = %e, "failed to send pong");
                }
                Ok(None)
            }
            Inbound::Query(query) => Ok(self.admit(conn, key, key_name, query)),
        }
    }

    /// Admission: key check, then limiters, then a detached task.
    fn admit(
        &self,
        conn: &Arc<dyn Connection>,
        key: Option<&KeyConfig>,
        key_name: &str,
        query: proto::MessageQuery,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let label = query_label(&query.query);
        metrics::record_request(key_name, label);

        let Some(key) = key else {
            self.answer_error(
                conn,
                key_name,
                label,
                query.query_id,
                LsError::new(codes::UNKNOWN_KEY, "unexpected server key"),
            );
            return None;
        };

        let admitted = key
            .per_ip
            .as_ref()
            .map_or(true, |b| b.try_acquire(conn.remote_ip(), QUERY_COST))
            && key.per_key.as_ref().map_or(true, |b| b.try_acquire(QUERY_COST));
        if !admitted {
            self.answer_error(
                conn,
                key_name,
                label,
                query.query_id,
                LsError::new(codes::TOO_MANY_REQUESTS, "too many requests"),
            );
            return None;
        }

        let frontend = self.clone();
        let conn = conn.clone();
        let key_name = key.name.clone();
        Some(tokio::spawn(async move {
            frontend.process(&conn, &key_name, query).await;
        }))
    }

    async fn process(&self, conn: &Arc<dyn Connection>, key_name: &str, query: proto::MessageQuery) {
        let started = Instant::now();
        let Some((reply, hit, label)) = self.run_query(query.query).await else {
            // observed behavior: a wait failure that is not a typed error
            // is dropped and the client's own timeout fires
            return;
        };

        if let Some(err) = reply.as_ls_error() {
            metrics::record_ls_error(key_name, label, err.code);
        }
        let elapsed = started.elapsed();
        metrics::record_query(key_name, label, hit, elapsed);
        debug!(query = label, hit = hit.as_str(), took = ?elapsed, "query finished");

        let answer =
            proto::MessageAnswer { query_id: query.query_id, answer: reply.to_bytes() };
        if let Err(e) = conn.send(tl_proto::serialize(&answer)) {
            debug!(error = %e, "failed to send response");
        }
    }

    async fn run_query(&self, payload: Vec<u8>) -> Option<(Reply, HitType, &'static str)> {
        let payload = match proto::unwrap_lite_query(payload) {
            Ok(payload) => payload,
            Err(err) => return Some((Reply::Error(err), HitType::FailedValidate, "Unknown")),
        };

        if self.inner.only_proxy {
            let label = query_label(&payload);
            let (reply, hit) = self.inner.dispatcher.forward(&payload).await;
            return Some((reply, hit, label));
        }

        let (wait, rest) = match proto::split_wait_prefix(&payload) {
            Ok(v) => v,
            Err(err) => {
                return Some((
                    Reply::Error(err),
                    HitType::FailedValidate,
                    "WaitMasterchainSeqno",
                ))
            }
        };
        if let Some(wait) = wait {
            let waited = Instant::now();
            let timeout = Duration::from_millis(u64::from(wait.timeout_ms));
            match self.inner.cache.wait_master_block(wait.seqno, timeout).await {
                Ok(()) => debug!(took = ?waited.elapsed(), "master block wait finished"),
                Err(CacheError::Ls(err)) => {
                    return Some((Reply::Error(err), HitType::FailedValidate, query_label(rest)))
                }
                Err(_) => return None,
            }
        }

        let query = match proto::Query::parse(rest) {
            Ok(query) => query,
            Err(err) => return Some((Reply::Error(err), HitType::FailedValidate, "Unknown")),
        };
        let label = query.kind();
        let (reply, hit) = self.inner.dispatcher.dispatch(&query, rest).await;
        Some((reply, hit, label))
    }

    fn answer_error(
        &self,
        conn: &Arc<dyn Connection>,
        key_name: &str,
        label: &'static str,
        query_id: [u8; 32],
        err: LsError,
    ) {
        metrics::record_ls_error(key_name, label, err.code);
        let answer =
            proto::MessageAnswer { query_id, answer: tl_proto::serialize(&err) };
        if let Err(e) = conn.send(tl_proto::serialize(&answer)) {
            debug!(error = %e, "failed to send error reply");
        }
    }
}

/// Metric label for a raw query payload, looking through the envelope and
/// the wait prefix.
fn query_label(payload: &[u8]) -> &'static str {
    let unwrapped;
    let mut data = payload;
    if proto::read_tl_id(data) == Some(proto::ids::LITE_QUERY) {
        match proto::unwrap_lite_query(data.to_vec()) {
            Ok(inner) => {
                unwrapped = inner;
                data = &unwrapped;
            }
            Err(_) => return "Unknown",
        }
    }
    let id = if proto::read_tl_id(data) == Some(proto::ids::WAIT_MASTERCHAIN_SEQNO) {
        data.get(12..).and_then(proto::read_tl_id)
    } else {
        proto::read_tl_id(data)
    };
    id.map_or("Unknown", proto::query_kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::testing::{self, MockBackend};
    use tokio::sync::mpsc;

    struct MockConnection {
        key: HashBytes,
        ip: IpAddr,
        sent_tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl Connection for MockConnection {
        fn server_key(&self) -> &HashBytes {
            &self.key
        }

        fn remote_ip(&self) -> IpAddr {
            self.ip
        }

        fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
            self.sent_tx.send(frame).map_err(|_| anyhow::anyhow!("receiver gone"))
        }
    }

    const KEY_ID: HashBytes = HashBytes([0x77; 32]);

    fn connection(key: HashBytes) -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let conn = MockConnection { key, ip: "127.0.0.1".parse().unwrap(), sent_tx };
        (Arc::new(conn), sent_rx)
    }

    fn frontend_with(
        backend: MockBackend,
        key_config: KeyConfig,
        only_proxy: bool,
    ) -> (Frontend, BlockCache) {
        let backend: Arc<dyn crate::backend::LiteBackend> = Arc::new(backend);
        let cache = BlockCache::new(backend.clone(), CacheConfig::default());
        let dispatcher = Dispatcher::new(cache.clone(), backend, None);
        let frontend =
            Frontend::new([(KEY_ID, key_config)], dispatcher, cache.clone(), only_proxy);
        (frontend, cache)
    }

    fn open_key() -> KeyConfig {
        KeyConfig::new("t1", 10, 0, 0)
    }

    fn query_frame(data: Vec<u8>) -> Vec<u8> {
        tl_proto::serialize(&proto::MessageQuery {
            query_id: [0x01; 32],
            query: tl_proto::serialize(&proto::LiteQuery { data }),
        })
    }

    async fn expect_answer(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        let frame = rx.recv().await.expect("an answer must arrive");
        let answer: proto::MessageAnswer = tl_proto::deserialize(&frame).unwrap();
        answer.answer
    }

    fn expect_ls_error(bytes: &[u8]) -> LsError {
        tl_proto::deserialize(bytes).expect("must be an ls error")
    }

    #[tokio::test]
    async fn ping_answers_pong_without_dispatch() {
        let (frontend, _) = frontend_with(MockBackend::unreachable(), open_key(), false);
        let (conn, mut rx) = connection(KEY_ID);

        let ping = tl_proto::serialize(&proto::TcpPing { random_id: 771 });
        frontend.handle_message(&conn, &ping).unwrap();

        let frame = rx.recv().await.unwrap();
        let pong: proto::TcpPong = tl_proto::deserialize(&frame).unwrap();
        assert_eq!(pong.random_id, 771);
    }

    #[tokio::test]
    async fn unknown_outer_message_is_a_protocol_error() {
        let (frontend, _) = frontend_with(MockBackend::unreachable(), open_key(), false);
        let (conn, _rx) = connection(KEY_ID);

        let garbage = tl_proto::serialize(&proto::TcpPong { random_id: 1 });
        let err = frontend.handle_message(&conn, &garbage).unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedMessage(_)));
    }

    #[tokio::test]
    async fn unknown_server_key_answers_401() {
        let (frontend, _) = frontend_with(MockBackend::unreachable(), open_key(), false);
        let (conn, mut rx) = connection(HashBytes([0xee; 32]));

        let frame = query_frame(tl_proto::serialize(&proto::GetMasterchainInfoExt { mode: 0 }));
        frontend.handle_message(&conn, &frame).unwrap();

        let err = expect_ls_error(&expect_answer(&mut rx).await);
        assert_eq!(err.code, codes::UNKNOWN_KEY);
        assert_eq!(err.message, "unexpected server key");
    }

    #[tokio::test]
    async fn per_key_limiter_rejects_with_429() {
        // one token, no leak: the second query in a row must bounce
        let key = KeyConfig::new("t1", 0, 1, 0);
        let (frontend, _) = frontend_with(MockBackend::unreachable(), key, false);
        let (conn, mut rx) = connection(KEY_ID);

        let frame = query_frame(proto::serialize_id_only(proto::ids::GET_VERSION));
        frontend.handle_message(&conn, &frame).unwrap();
        frontend.handle_message(&conn, &frame).unwrap();

        let mut saw_version = false;
        let mut saw_limit = false;
        for _ in 0..2 {
            let answer = expect_answer(&mut rx).await;
            match proto::read_tl_id(&answer) {
                Some(proto::ids::VERSION) => saw_version = true,
                Some(proto::ids::ERROR) => {
                    let err = expect_ls_error(&answer);
                    assert_eq!(err.code, codes::TOO_MANY_REQUESTS);
                    assert_eq!(err.message, "too many requests");
                    saw_limit = true;
                }
                other => panic!("unexpected answer id {other:?}"),
            }
        }
        assert!(saw_version && saw_limit);
    }

    #[tokio::test]
    async fn per_ip_limiter_rejects_with_429() {
        let key = KeyConfig::new("t1", 0, 0, 1);
        let (frontend, _) = frontend_with(MockBackend::unreachable(), key, false);
        let (conn, mut rx) = connection(KEY_ID);

        let frame = query_frame(proto::serialize_id_only(proto::ids::GET_TIME));
        frontend.handle_message(&conn, &frame).unwrap();
        frontend.handle_message(&conn, &frame).unwrap();

        let mut codes_seen = Vec::new();
        for _ in 0..2 {
            let answer = expect_answer(&mut rx).await;
            codes_seen.push(proto::read_tl_id(&answer));
        }
        assert!(codes_seen.contains(&Some(proto::ids::CURRENT_TIME)));
        assert!(codes_seen.contains(&Some(proto::ids::ERROR)));
    }

    #[tokio::test]
    async fn lone_wait_directive_is_rejected() {
        let (frontend, _) = frontend_with(MockBackend::unreachable(), open_key(), false);
        let (conn, mut rx) = connection(KEY_ID);

        let wait = tl_proto::serialize(&proto::WaitMasterchainSeqno { seqno: 5, timeout_ms: 100 });
        frontend.handle_message(&conn, &query_frame(wait)).unwrap();

        let err = expect_ls_error(&expect_answer(&mut rx).await);
        assert_eq!(err.code, codes::BAD_REQUEST);
        assert_eq!(err.message, "unexpected len of queries");
    }

    #[tokio::test]
    async fn satisfied_wait_processes_the_inner_query() {
        let (frontend, cache) = frontend_with(MockBackend::unreachable(), open_key(), false);
        cache.publish_last(testing::master_block(50));
        let (conn, mut rx) = connection(KEY_ID);

        let mut compound =
            tl_proto::serialize(&proto::WaitMasterchainSeqno { seqno: 50, timeout_ms: 1000 });
        compound.extend_from_slice(&proto::serialize_id_only(proto::ids::GET_TIME));
        frontend.handle_message(&conn, &query_frame(compound)).unwrap();

        let answer = expect_answer(&mut rx).await;
        assert_eq!(proto::read_tl_id(&answer), Some(proto::ids::CURRENT_TIME));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_is_forwarded_as_ls_error() {
        let (frontend, cache) = frontend_with(MockBackend::unreachable(), open_key(), false);
        cache.publish_last(testing::master_block(50));
        let (conn, mut rx) = connection(KEY_ID);

        let mut compound =
            tl_proto::serialize(&proto::WaitMasterchainSeqno { seqno: 150, timeout_ms: 1000 });
        compound.extend_from_slice(&proto::serialize_id_only(proto::ids::GET_TIME));
        frontend.handle_message(&conn, &query_frame(compound)).unwrap();

        let err = expect_ls_error(&expect_answer(&mut rx).await);
        assert_eq!(err.code, codes::WAIT_TIMEOUT);
    }

    #[tokio::test]
    async fn only_proxy_forwards_everything() {
        let backend = MockBackend::replying(|req| {
            // even a pure-emulation query reaches the backend untouched
            assert_eq!(proto::read_tl_id(req), Some(proto::ids::GET_VERSION));
            Ok(vec![1, 2, 3, 4])
        });
        let (frontend, _) = frontend_with(backend, open_key(), true);
        let (conn, mut rx) = connection(KEY_ID);

        let frame = query_frame(proto::serialize_id_only(proto::ids::GET_VERSION));
        frontend.handle_message(&conn, &frame).unwrap();

        let answer = expect_answer(&mut rx).await;
        assert_eq!(answer, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn replies_are_tagged_with_the_original_query_id() {
        let (frontend, _) = frontend_with(MockBackend::unreachable(), open_key(), false);
        let (conn, mut rx) = connection(KEY_ID);

        let query = proto::MessageQuery {
            query_id: [0x42; 32],
            query: tl_proto::serialize(&proto::LiteQuery {
                data: proto::serialize_id_only(proto::ids::GET_TIME),
            }),
        };
        frontend.handle_message(&conn, &tl_proto::serialize(&query)).unwrap();

        let frame = rx.recv().await.unwrap();
        let answer: proto::MessageAnswer = tl_proto::deserialize(&frame).unwrap();
        assert_eq!(answer.query_id, [0x42; 32]);
    }
}
