//! Per-connection read loop.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::{Peer, Transport};
use crate::error::{CoordinatorError, Result};
use crate::protocol::FrameBuffer;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Read frames from `reader` and route them until EOF, a protocol
/// violation, `shutdown`, or the peer's writer closing. The peer is always
/// disconnected afterwards.
pub(crate) async fn serve_connection<R>(
    transport: Arc<Transport>,
    peer: Arc<Peer>,
    reader: R,
    max_payload_size: u32,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    transport.connected(&peer);
    let result = read_loop(&transport, &peer, reader, max_payload_size, &shutdown).await;

    match &result {
        Ok(()) => tracing::debug!(peer = peer.id(), "connection closed"),
        Err(CoordinatorError::Protocol(reason)) => tracing::warn!(
            peer = peer.id(),
            addr = peer.addr(),
            %reason,
            "protocol violation, closing connection"
        ),
        Err(e) => tracing::debug!(peer = peer.id(), error = %e, "connection failed"),
    }

    transport.disconnect(&peer);
    result
}

async fn read_loop<R>(
    transport: &Transport,
    peer: &Arc<Peer>,
    mut reader: R,
    max_payload_size: u32,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = peer.writer.closed() => return Err(CoordinatorError::ConnectionClosed),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        for frame in frames.push(&buf[..n])? {
            transport.on_frame(peer, frame).await?;
        }
    }
}
