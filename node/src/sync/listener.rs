// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Inbound peer listener.
//!
//! Accepts connections and runs each one as an independent acceptor
//! session. Identity checking happens inside the session handshake: a
//! connection claiming an unprovisioned node id is refused there.

use crate::coordinator::Coordinator;
use crate::sync::session::run_session;
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn run_listener(co: Arc<Coordinator>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let _ = stream.set_nodelay(true);
                tracing::debug!(%remote, "inbound peer connection");
                let co = co.clone();
                tokio::spawn(async move {
                    match run_session(co, stream, None, false).await {
                        Ok(()) => tracing::debug!(%remote, "inbound session closed"),
                        Err(e) => tracing::debug!(%remote, "inbound session ended: {}", e),
                    }
                });
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
