//! Backend pool over the framed transport.
//!
//! A thin round-robin client: one lazily established connection per
//! configured upstream address, requests multiplexed by ADNL query id.
//! A connection failure fails every request pending on it and the next
//! query reconnects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use liteproxy_core::backend::{BackendError, LiteBackend};
use liteproxy_core::proto;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::transport::{read_frame, write_frame};

/// Replies slower than this fail the request; callers retry or surface a
/// timeout themselves.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<DashMap<[u8; 32], oneshot::Sender<Vec<u8>>, ahash::RandomState>>;

struct PeerLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
}

struct Peer {
    addr: String,
    link: Mutex<Option<Arc<PeerLink>>>,
}

pub struct PooledBackend {
    peers: Vec<Peer>,
    server_key_id: [u8; 32],
    next: AtomicUsize,
}

impl PooledBackend {
    pub fn new(addrs: Vec<String>, server_key_id: [u8; 32]) -> anyhow::Result<Self> {
        anyhow::ensure!(!addrs.is_empty(), "backend pool needs at least one address");
        Ok(Self {
            peers: addrs.into_iter().map(|addr| Peer { addr, link: Mutex::new(None) }).collect(),
            server_key_id,
            next: AtomicUsize::new(0),
        })
    }

    async fn link_for(&self, peer: &Peer) -> anyhow::Result<Arc<PeerLink>> {
        let mut slot = peer.link.lock().await;
        if let Some(link) = slot.as_ref() {
            if !link.tx.is_closed() {
                return Ok(link.clone());
            }
        }
        let link = connect(&peer.addr, self.server_key_id).await?;
        *slot = Some(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl LiteBackend for PooledBackend {
    async fn query_raw(&self, query: &[u8]) -> Result<Vec<u8>, BackendError> {
        let peer = &self.peers[self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len()];
        let link = self.link_for(peer).await.map_err(BackendError::Transport)?;

        let query_id: [u8; 32] = rand::random();
        let (reply_tx, reply_rx) = oneshot::channel();
        link.pending.insert(query_id, reply_tx);

        let message = proto::MessageQuery {
            query_id,
            query: tl_proto::serialize(&proto::LiteQuery { data: query.to_vec() }),
        };
        if link.tx.send(tl_proto::serialize(&message)).is_err() {
            link.pending.remove(&query_id);
            return Err(BackendError::Transport(anyhow::anyhow!(
                "backend connection to {} is gone",
                peer.addr
            )));
        }

        match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BackendError::Transport(anyhow::anyhow!(
                "backend connection to {} dropped the request",
                peer.addr
            ))),
            Err(_) => {
                link.pending.remove(&query_id);
                Err(BackendError::Timeout)
            }
        }
    }
}

async fn connect(addr: &str, server_key_id: [u8; 32]) -> anyhow::Result<Arc<PeerLink>> {
    let stream = TcpStream::connect(addr).await.with_context(|| format!("connecting {addr}"))?;
    stream.set_nodelay(true).ok();
    let (mut rd, mut wr) = stream.into_split();

    write_frame(&mut wr, &server_key_id).await.context("sending hello")?;

    let pending: Pending = Arc::new(DashMap::default());
    let (tx, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if let Err(e) = write_frame(&mut wr, &frame).await {
                debug!(error = %e, "backend writer closed");
                break;
            }
        }
    });

    let reader_pending = pending.clone();
    let peer = addr.to_string();
    tokio::spawn(async move {
        loop {
            let frame = match read_frame(&mut rd).await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(addr = %peer, error = %e, "backend connection lost");
                    break;
                }
            };
            if proto::read_tl_id(&frame) != Some(proto::ids::MESSAGE_ANSWER) {
                continue;
            }
            let Ok(answer) = tl_proto::deserialize::<proto::MessageAnswer>(&frame) else {
                continue;
            };
            if let Some((_, reply_tx)) = reader_pending.remove(&answer.query_id) {
                reply_tx.send(answer.answer).ok();
            }
        }
        // fail everything still in flight on this connection
        reader_pending.clear();
    });

    Ok(Arc::new(PeerLink { tx, pending }))
}
