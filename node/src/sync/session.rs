// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-peer sync session.
//!
//! One session per connection, driven from both ends of the socket:
//!
//! ```text
//! Idle -> HandshakeSent -> HeightExchanged -> {InSync | Syncing} -> Idle
//! ```
//!
//! After the hello exchange the session loops on one comparison:
//! - peer ahead: request missing blocks one at a time, each validated and
//!   committed before the next is requested
//! - equal height, equal hash: in sync, forwarding local broadcasts,
//!   sending periodic height adverts, serving the peer's requests
//! - equal height, different hash: walk backward to the common ancestor
//!   (bounded by the reorg limit), fetch the competing branch, and let
//!   fork choice decide
//! - peer behind: stay responsive; the peer drives its own catch-up
//!
//! The protocol is full duplex: while waiting for a block response the
//! session keeps serving the peer's own requests, so two nodes can sync
//! against each other over a single connection without deadlocking.
//! Inbound frames are decoded by a dedicated reader task feeding a
//! channel; frame reads are never cancelled mid-message.
//!
//! Every wait is deadline-bounded. A stalled or misbehaving peer drops
//! the session back to Idle; the dialer reconnects on exponential
//! backoff.

use crate::coordinator::{Coordinator, IngestOutcome};
use crate::errors::{NodeError, SyncError};
use crate::sync::wire::{read_message, write_message, ErrorCode, SyncMessage};
use forgeline_kernel::block::Block;
use forgeline_kernel::crypto::NodeId;
use forgeline_kernel::types::hash::BlockHash;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    HandshakeSent,
    HeightExchanged,
    InSync,
    Syncing,
}

/// Last advertised view of the peer's chain tip.
struct PeerTip {
    height: u64,
    head_hash: BlockHash,
}

type Inbound = mpsc::Receiver<Result<SyncMessage, SyncError>>;

/// Run a session over an established stream.
///
/// `expected_peer` pins the identity a dialer expects on the other end;
/// an acceptor passes `None` and learns it from the hello. `initiator`
/// decides who speaks first in the handshake.
pub async fn run_session<S>(
    co: Arc<Coordinator>,
    stream: S,
    expected_peer: Option<NodeId>,
    initiator: bool,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let io_timeout = co.cfg.peer_timeout();

    let state = SessionState::HandshakeSent;
    tracing::debug!(?state, initiator, "session starting");

    // Handshake happens on the raw stream; the reader task takes over
    // afterwards.
    let (peer_id, tip) = if initiator {
        send_hello(&co, &mut writer).await?;
        expect_hello(&mut reader, io_timeout).await?
    } else {
        let hello = expect_hello(&mut reader, io_timeout).await?;
        send_hello(&co, &mut writer).await?;
        hello
    };

    if let Some(expected) = expected_peer {
        if peer_id != expected {
            return Err(SyncError::Protocol(format!(
                "peer identified as {} but {} was expected",
                peer_id, expected
            )));
        }
    }
    if !co.known_nodes().contains(&peer_id) {
        let _ = write_message(
            &mut writer,
            &SyncMessage::Error {
                code: ErrorCode::InvalidBlock,
            },
        )
        .await;
        return Err(SyncError::Protocol(format!(
            "peer {} is not provisioned",
            peer_id
        )));
    }

    co.peers.record_contact(&peer_id, tip.height);

    // Frame decoding runs in its own task so the main loop can select
    // without ever cancelling a partial read.
    let (msg_tx, mut msg_rx) = mpsc::channel::<Result<SyncMessage, SyncError>>(32);
    let reader_task = tokio::spawn(async move {
        loop {
            let result = read_message(&mut reader).await;
            let failed = result.is_err();
            if msg_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    let result = drive_session(&co, peer_id, tip, &mut msg_rx, &mut writer).await;
    reader_task.abort();
    result
}

async fn drive_session<S>(
    co: &Arc<Coordinator>,
    peer_id: NodeId,
    mut tip: PeerTip,
    inbound: &mut Inbound,
    writer: &mut WriteHalf<S>,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    let mut state = SessionState::HeightExchanged;
    tracing::debug!(?state, peer = %peer_id, peer_height = tip.height, "handshake complete");

    let mut broadcast_rx = co.subscribe_broadcast();
    let mut advert = tokio::time::interval(co.cfg.advert_interval());
    advert.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // A peer silent past this window is dropped back to Idle.
    let idle_deadline = co.cfg.peer_silence_timeout();

    loop {
        let (local_height, local_hash) = co.chain.status().await;

        if tip.height > local_height {
            state = SessionState::Syncing;
            tracing::debug!(?state, peer = %peer_id, from = local_height + 1, to = tip.height, "catching up");
            catch_up(co, &peer_id, inbound, writer, &mut tip).await?;
            continue;
        }

        if tip.height == local_height && tip.head_hash != local_hash && local_height > 0 {
            state = SessionState::Syncing;
            tracing::info!(?state, peer = %peer_id, height = local_height, "fork detected at head");
            resolve_fork(co, &peer_id, inbound, writer, &mut tip).await?;
            // Whatever fork choice decided, refresh the peer's view of us.
            send_advert(co, writer).await?;
            continue;
        }

        if state != SessionState::InSync {
            state = SessionState::InSync;
            tracing::debug!(?state, peer = %peer_id, height = local_height, "in sync");
        }

        tokio::select! {
            received = timeout(idle_deadline, inbound.recv()) => {
                let message = match received {
                    Ok(Some(result)) => result?,
                    Ok(None) => return Err(SyncError::Closed),
                    Err(_) => return Err(SyncError::PeerTimeout),
                };
                handle_idle_message(co, &peer_id, message, writer, &mut tip).await?;
            }
            sealed = broadcast_rx.recv() => {
                match sealed {
                    Ok(block) => {
                        write_message(writer, &SyncMessage::BlockBroadcast { block }).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed broadcasts are recovered by the height
                        // exchange on the next advert.
                        tracing::debug!(skipped, "broadcast receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            _ = advert.tick() => {
                send_advert(co, writer).await?;
            }
        }
    }
}

async fn send_hello<S>(co: &Coordinator, writer: &mut WriteHalf<S>) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    let (height, head_hash) = co.chain.status().await;
    write_message(
        writer,
        &SyncMessage::Hello {
            node_id: co.node_id(),
            height,
            head_hash,
        },
    )
    .await
}

async fn send_advert<S>(co: &Coordinator, writer: &mut WriteHalf<S>) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    let (height, head_hash) = co.chain.status().await;
    write_message(writer, &SyncMessage::HeightAdvert { height, head_hash }).await
}

async fn expect_hello<R>(reader: &mut R, io_timeout: Duration) -> Result<(NodeId, PeerTip), SyncError>
where
    R: AsyncRead + Unpin,
{
    let message = timeout(io_timeout, read_message(reader))
        .await
        .map_err(|_| SyncError::PeerTimeout)??;
    match message {
        SyncMessage::Hello {
            node_id,
            height,
            head_hash,
        } => Ok((node_id, PeerTip { height, head_hash })),
        other => Err(SyncError::Protocol(format!(
            "expected Hello, got {}",
            message_kind(&other)
        ))),
    }
}

/// Handle one message on an in-sync session.
async fn handle_idle_message<S>(
    co: &Arc<Coordinator>,
    peer_id: &NodeId,
    message: SyncMessage,
    writer: &mut WriteHalf<S>,
    tip: &mut PeerTip,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    match message {
        SyncMessage::Hello {
            height, head_hash, ..
        }
        | SyncMessage::HeightAdvert { height, head_hash } => {
            tip.height = height;
            tip.head_hash = head_hash;
            co.peers.record_contact(peer_id, height);
        }
        SyncMessage::BlockRequest { from, to } => {
            serve_block_request(co, writer, from, to).await?;
        }
        SyncMessage::BlockBroadcast { block } => {
            let block_height = block.height;
            let block_hash = block.block_hash;
            match co.ingest_block(block, peer_id).await {
                Ok(IngestOutcome::Committed { height }) => {
                    co.peers.record_contact(peer_id, height);
                }
                Ok(IngestOutcome::Ahead { target }) => {
                    // Catch up on the next loop pass.
                    tip.height = target;
                    tip.head_hash = block_hash;
                }
                Ok(IngestOutcome::ForkDetected) => {
                    tip.height = block_height;
                    tip.head_hash = block_hash;
                }
                Ok(IngestOutcome::AlreadyHave) | Ok(IngestOutcome::Stale) => {}
                Err(NodeError::Validation(e)) => {
                    // Discard the rest of this peer's batch by ending the
                    // session; the peer is flagged, not banned.
                    return Err(SyncError::Validation(e));
                }
                Err(e) => return Err(SyncError::Local(e.to_string())),
            }
        }
        SyncMessage::BlockResponse { .. } => {
            // A straggler from an aborted transfer; harmless.
            tracing::debug!(peer = %peer_id, "ignoring unsolicited block response");
        }
        SyncMessage::Error { code } => {
            tracing::warn!(peer = %peer_id, ?code, "peer reported error");
            if code == ErrorCode::DivergenceTooDeep {
                return Err(SyncError::ChainDivergenceTooDeep);
            }
        }
    }
    Ok(())
}

async fn serve_block_request<S>(
    co: &Coordinator,
    writer: &mut WriteHalf<S>,
    from: u64,
    to: u64,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    for height in from..=to {
        match co.chain.get_block(height).await {
            Some(block) => {
                write_message(writer, &SyncMessage::BlockResponse { block }).await?;
            }
            None => {
                write_message(
                    writer,
                    &SyncMessage::Error {
                        code: ErrorCode::RangeUnavailable,
                    },
                )
                .await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Request one block by height and wait for its response, serving the
/// peer's own traffic in the meantime.
async fn fetch_block<S>(
    co: &Arc<Coordinator>,
    peer_id: &NodeId,
    inbound: &mut Inbound,
    writer: &mut WriteHalf<S>,
    height: u64,
) -> Result<Block, SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    write_message(
        writer,
        &SyncMessage::BlockRequest {
            from: height,
            to: height,
        },
    )
    .await?;

    let io_timeout = co.cfg.peer_timeout();
    loop {
        let message = match timeout(io_timeout, inbound.recv()).await {
            Ok(Some(result)) => result?,
            Ok(None) => return Err(SyncError::Closed),
            Err(_) => return Err(SyncError::PeerTimeout),
        };
        match message {
            SyncMessage::BlockResponse { block } => return Ok(block),
            // Keep the full-duplex side alive while we wait.
            SyncMessage::BlockRequest { from, to } => {
                serve_block_request(co, writer, from, to).await?;
            }
            SyncMessage::Hello { height, .. } | SyncMessage::HeightAdvert { height, .. } => {
                co.peers.record_contact(peer_id, height);
            }
            SyncMessage::BlockBroadcast { .. } => {
                // Recovered by height exchange once the transfer is done.
                tracing::debug!("deferring broadcast received mid-transfer");
            }
            SyncMessage::Error { code } => {
                return Err(match code {
                    ErrorCode::DivergenceTooDeep => SyncError::ChainDivergenceTooDeep,
                    other => SyncError::Protocol(format!("peer error {:?}", other)),
                });
            }
        }
    }
}

/// Pull the peer's blocks `[local+1, tip]`, committing each before the
/// next request so an unvalidated prefix is never trusted.
async fn catch_up<S>(
    co: &Arc<Coordinator>,
    peer_id: &NodeId,
    inbound: &mut Inbound,
    writer: &mut WriteHalf<S>,
    tip: &mut PeerTip,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let (local_height, _) = co.chain.status().await;
        if local_height >= tip.height {
            return Ok(());
        }

        let block = fetch_block(co, peer_id, inbound, writer, local_height + 1).await?;
        if block.height != local_height + 1 {
            return Err(SyncError::Protocol(format!(
                "requested block {} but received {}",
                local_height + 1,
                block.height
            )));
        }

        match co.ingest_block(block, peer_id).await {
            Ok(IngestOutcome::Committed { height }) => {
                co.peers.record_contact(peer_id, tip.height.max(height));
            }
            Ok(IngestOutcome::ForkDetected) => {
                // The peer is ahead on a different lineage; find the
                // common ancestor before pulling anything else.
                return resolve_fork(co, peer_id, inbound, writer, tip).await;
            }
            Ok(IngestOutcome::AlreadyHave) | Ok(IngestOutcome::Stale) => {
                // Another session landed this height first; re-compare.
            }
            Ok(IngestOutcome::Ahead { .. }) => {
                return Err(SyncError::Protocol(
                    "non-contiguous block during catch-up".into(),
                ));
            }
            Err(NodeError::Validation(e)) => return Err(SyncError::Validation(e)),
            Err(e) => return Err(SyncError::Local(e.to_string())),
        }
    }
}

/// Resolve a divergence against this peer.
///
/// Walks backward by height until a common ancestor is found, bounded by
/// `max_reorg_depth`; fetches the peer's competing branch; and applies
/// the deterministic fork choice. Divergence deeper than the bound is
/// surfaced as `ChainDivergenceTooDeep` for the operator; long local
/// history is never silently overwritten.
async fn resolve_fork<S>(
    co: &Arc<Coordinator>,
    peer_id: &NodeId,
    inbound: &mut Inbound,
    writer: &mut WriteHalf<S>,
    tip: &mut PeerTip,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite,
{
    let (local_height, _) = co.chain.status().await;
    let mut divergence = None;

    let mut candidate = local_height.min(tip.height);
    loop {
        if local_height - candidate > co.cfg.max_reorg_depth {
            break;
        }
        let peer_block = fetch_block(co, peer_id, inbound, writer, candidate).await?;
        if co.chain.block_hash_at(candidate).await == Some(peer_block.block_hash) {
            divergence = Some(candidate);
            break;
        }
        if candidate == 0 {
            return Err(SyncError::Protocol("genesis mismatch with peer".into()));
        }
        candidate -= 1;
    }

    let Some(divergence) = divergence else {
        let _ = write_message(
            writer,
            &SyncMessage::Error {
                code: ErrorCode::DivergenceTooDeep,
            },
        )
        .await;
        tracing::error!(
            peer = %peer_id,
            local_height,
            limit = co.cfg.max_reorg_depth,
            "divergence exceeds the reorg limit; operator intervention required"
        );
        return Err(SyncError::ChainDivergenceTooDeep);
    };

    let mut branch = Vec::with_capacity((tip.height - divergence) as usize);
    for height in divergence + 1..=tip.height {
        branch.push(fetch_block(co, peer_id, inbound, writer, height).await?);
    }

    match co.adopt_branch(divergence, branch).await {
        Ok(outcome) => {
            tracing::debug!(peer = %peer_id, ?outcome, "fork resolution finished");
            Ok(())
        }
        Err(NodeError::Validation(e)) => {
            co.peers.record_validation_failure(peer_id);
            metrics::increment_counter!("forgeline_peer_validation_failures_total");
            Err(SyncError::Validation(e))
        }
        Err(e) => Err(SyncError::Local(e.to_string())),
    }
}

fn message_kind(message: &SyncMessage) -> &'static str {
    match message {
        SyncMessage::Hello { .. } => "Hello",
        SyncMessage::HeightAdvert { .. } => "HeightAdvert",
        SyncMessage::BlockRequest { .. } => "BlockRequest",
        SyncMessage::BlockResponse { .. } => "BlockResponse",
        SyncMessage::BlockBroadcast { .. } => "BlockBroadcast",
        SyncMessage::Error { .. } => "Error",
    }
}

/// Dial `addr` and run sessions forever, reconnecting on exponential
/// backoff. Peer failures never touch the local sealing path.
pub async fn run_dialer(co: Arc<Coordinator>, peer_id: NodeId, addr: String) {
    let mut backoff = co.cfg.retry_backoff();

    loop {
        match timeout(co.cfg.peer_timeout(), TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                tracing::info!(peer = %peer_id, %addr, "peer connected");
                match run_session(co.clone(), stream, Some(peer_id), true).await {
                    Ok(()) => tracing::info!(peer = %peer_id, "session closed"),
                    Err(e) => tracing::warn!(peer = %peer_id, "session ended: {}", e),
                }
                backoff = co.cfg.retry_backoff();
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer_id, %addr, "connect failed: {}", e);
            }
            Err(_) => {
                tracing::debug!(peer = %peer_id, %addr, "connect timed out");
            }
        }

        // A peer with validation failures on record reconnects at lower
        // priority; the count never bans it outright.
        let penalty = co.peers.validation_failures(&peer_id).min(4);
        tokio::time::sleep(backoff * (1 + penalty)).await;
        backoff = (backoff * 2).min(co.cfg.retry_backoff_max());
    }
}
