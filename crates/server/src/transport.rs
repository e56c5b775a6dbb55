//! Trusted-link framed transport.
//!
//! Frames are `u32` little-endian length followed by a TL payload. The
//! first frame of a connection carries the 32-byte key id of the server
//! identity the client wants to talk to; every later frame is an ADNL
//! message. Session encryption and key exchange are the business of the
//! terminator in front of this process.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use everscale_types::cell::HashBytes;
use liteproxy_core::frontend::{Connection, Frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Big enough for any block payload, small enough to bound a hostile
/// client.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn read_frame(rd: &mut OwnedReadHalf) -> anyhow::Result<Vec<u8>> {
    let len = rd.read_u32_le().await.context("reading frame length")? as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds the limit");
    let mut frame = vec![0u8; len];
    rd.read_exact(&mut frame).await.context("reading frame body")?;
    Ok(frame)
}

pub async fn write_frame(wr: &mut OwnedWriteHalf, frame: &[u8]) -> anyhow::Result<()> {
    wr.write_u32_le(frame.len() as u32).await?;
    wr.write_all(frame).await?;
    Ok(())
}

struct TcpConnection {
    key_id: HashBytes,
    ip: IpAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection for TcpConnection {
    fn server_key(&self) -> &HashBytes {
        &self.key_id
    }

    fn remote_ip(&self) -> IpAddr {
        self.ip
    }

    fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.tx.send(frame).map_err(|_| anyhow::anyhow!("connection writer is gone"))
    }
}

/// Accept loop. Runs until `shutdown` fires.
pub async fn serve(
    listen_addr: &str,
    frontend: Frontend,
    shutdown: &broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(addr = listen_addr, "listening for clients");

    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting client")?;
                let frontend = frontend.clone();
                tokio::spawn(async move {
                    let ip = peer.ip();
                    frontend.on_connect(ip);
                    if let Err(e) = handle_client(stream, ip, &frontend).await {
                        debug!(%ip, error = %e, "client session ended");
                    }
                    frontend.on_disconnect(ip);
                });
            }
            _ = shutdown_rx.recv() => {
                info!("listener stopped");
                return Ok(());
            }
        }
    }
}

async fn handle_client(stream: TcpStream, ip: IpAddr, frontend: &Frontend) -> anyhow::Result<()> {
    stream.set_nodelay(true).ok();
    let (mut rd, mut wr) = stream.into_split();

    // hello frame: the key id the client addresses
    let hello = read_frame(&mut rd).await?;
    let key_id: [u8; 32] =
        hello.as_slice().try_into().map_err(|_| anyhow::anyhow!("malformed hello frame"))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut wr, &frame).await {
                debug!(error = %e, "writer closed");
                break;
            }
        }
    });

    let conn: Arc<dyn Connection> =
        Arc::new(TcpConnection { key_id: HashBytes(key_id), ip, tx });
    let mut tasks = Vec::new();
    let result = read_loop(&mut rd, &conn, frontend, &mut tasks).await;

    // cancel work owned by this connection alone; shared cache fetches
    // with other waiters attached keep running
    for task in &tasks {
        task.abort();
    }
    result
}

async fn read_loop(
    rd: &mut OwnedReadHalf,
    conn: &Arc<dyn Connection>,
    frontend: &Frontend,
    tasks: &mut Vec<tokio::task::JoinHandle<()>>,
) -> anyhow::Result<()> {
    loop {
        let frame = match read_frame(rd).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "read loop ended");
                return Ok(());
            }
        };
        match frontend.handle_message(conn, &frame) {
            Ok(Some(task)) => {
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(ip = %conn.remote_ip(), error = %e, "protocol error");
                anyhow::bail!("protocol error: {e}");
            }
        }
    }
}
