//! Seam to the upstream backend pool.
//!
//! The pool itself (load balancing, health checks, transport) lives behind
//! [`LiteBackend`]: one raw query entry point taking a serialized
//! light-server function and returning the serialized reply. The typed
//! [`query`] helper is what the cache uses for its own fetches; it decodes
//! `liteServer.error` replies into [`BackendError::Ls`] so callers can
//! forward them verbatim.

use async_trait::async_trait;
use tl_proto::TlWrite;

use crate::proto::{self, LsError};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A typed error reply from the backend; forwarded to clients as-is.
    #[error(transparent)]
    Ls(#[from] LsError),

    #[error("backend node timeout")]
    Timeout,

    #[error("backend transport: {0}")]
    Transport(#[from] anyhow::Error),
}

#[async_trait]
pub trait LiteBackend: Send + Sync + 'static {
    /// Sends one serialized light-server query and returns the raw reply
    /// bytes. A reply shaped as `liteServer.error` is returned as ordinary
    /// bytes; surfacing it as a typed error is the caller's concern.
    async fn query_raw(&self, query: &[u8]) -> Result<Vec<u8>, BackendError>;
}

/// Typed query against the backend. Error replies become
/// [`BackendError::Ls`], undecodable replies a transport error.
pub async fn query<Q, R>(backend: &dyn LiteBackend, request: &Q) -> Result<R, BackendError>
where
    Q: TlWrite,
    R: for<'a> tl_proto::TlRead<'a, Repr = tl_proto::Boxed>,
{
    let reply = backend.query_raw(&tl_proto::serialize(request)).await?;
    if proto::read_tl_id(&reply) == Some(LsError::TL_ID) {
        let err: LsError = tl_proto::deserialize(&reply)
            .map_err(|e| anyhow::anyhow!("undecodable error reply: {e:?}"))?;
        return Err(BackendError::Ls(err));
    }
    tl_proto::deserialize(&reply)
        .map_err(|e| BackendError::Transport(anyhow::anyhow!("unexpected backend reply: {e:?}")))
}
