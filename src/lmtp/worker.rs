//! The subprocess worker loop.
//!
//! A worker process hosts one [`LocalModel`] behind a [`TokenSession`] and
//! speaks LMTP frames over its own stdin/stdout. The parent connects via
//! [`PipeTransport::spawn`](crate::lmtp::transport::PipeTransport::spawn).
//! When the parent dies, the worker's stdin reaches EOF and the loop exits.

use std::sync::Arc;

use crate::error::Result;
use crate::lmtp::model::LocalModel;
use crate::lmtp::session::serve_transport;
use crate::lmtp::transport::stdio_pair;

/// Serve a model over this process's stdio until the parent closes the
/// pipe. Intended to be the body of a worker binary's `main`.
pub async fn run_worker(model: Arc<dyn LocalModel>) -> Result<()> {
    tracing::info!("lmtp worker serving over stdio");
    let handle = serve_transport(model, stdio_pair());
    handle.await.ok();
    tracing::info!("parent pipe closed, worker exiting");
    Ok(())
}
