// Layer 1: Standard library imports
use std::fmt;
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

// Layer 3: Internal module imports
use crate::message::{downcast, BoxMessage, EntityMessage, TypeMismatch};
use crate::pubsub::ChannelId;
use crate::shard::{ShardMsg, ShardRef, SyncShardMsg};
use crate::util::EntityId;

/// Default wall-clock limit for [`SyncChannel::receive`].
pub const DEFAULT_SYNC_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by synchronize channels.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The channel (or the needed direction of it) is closed.
    #[error("synchronize channel closed")]
    ChannelClosed,

    /// No frame arrived within the wall-clock limit.
    #[error("synchronize receive timed out after {0:?}")]
    Timeout(Duration),

    /// A frame carried a different type than the receiver expected.
    #[error("synchronize frame type mismatch")]
    TypeMismatch(#[from] TypeMismatch),

    /// The peer had no handler for the opening message.
    #[error("synchronize open rejected by {target}")]
    Rejected {
        /// The peer that rejected the open.
        target: EntityId,
    },

    /// The open handshake could not complete.
    #[error("synchronize open to {target} failed: {reason}")]
    OpenFailed {
        /// The intended peer.
        target: EntityId,
        /// Why the handshake failed.
        reason: String,
    },
}

/// One frame on the wire between shards and entities.
#[derive(Debug)]
pub(crate) enum SyncFrame {
    /// A payload frame.
    Message(BoxMessage),
    /// End of stream from the peer.
    Eof,
}

/// Half-close state of a synchronize channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncChannelState {
    /// Both directions open.
    Open,
    /// We sent EOF; inbound frames still accepted.
    LocalClosed,
    /// Peer sent EOF; we can still write.
    RemoteClosed,
    /// Both directions closed.
    Closed,
}

/// One endpoint of a paired synchronize channel.
///
/// Writes go to the owning shard, which translates the channel id and
/// forwards to the peer shard; reads come straight off a dedicated queue the
/// hosting shard writes into, independent of the mailbox. Dropping the
/// endpoint sends EOF to the peer.
///
/// # Example
/// ```rust,ignore
/// // Inside a synchronize handler: strict ping/pong phases.
/// let mut channel: SyncChannel = /* handed to the handler */;
/// channel.send(Ping { seq: 1 })?;
/// let pong: Pong = channel.receive().await?;
/// channel.close();
/// ```
pub struct SyncChannel {
    owner: EntityId,
    peer: EntityId,
    local_channel: ChannelId,
    reader: mpsc::UnboundedReceiver<SyncFrame>,
    shard: ShardRef,
    local_closed: bool,
    remote_closed: bool,
}

impl SyncChannel {
    pub(crate) fn new(
        owner: EntityId,
        peer: EntityId,
        local_channel: ChannelId,
        reader: mpsc::UnboundedReceiver<SyncFrame>,
        shard: ShardRef,
    ) -> Self {
        Self { owner, peer, local_channel, reader, shard, local_closed: false, remote_closed: false }
    }

    /// The entity on the other end.
    pub fn peer(&self) -> EntityId {
        self.peer
    }

    /// Our side's channel id.
    pub fn channel_id(&self) -> ChannelId {
        self.local_channel
    }

    /// Current half-close state.
    pub fn state(&self) -> SyncChannelState {
        match (self.local_closed, self.remote_closed) {
            (false, false) => SyncChannelState::Open,
            (true, false) => SyncChannelState::LocalClosed,
            (false, true) => SyncChannelState::RemoteClosed,
            (true, true) => SyncChannelState::Closed,
        }
    }

    /// Send a frame to the peer.
    ///
    /// # Errors
    ///
    /// [`SyncError::ChannelClosed`] after [`SyncChannel::close`] (or drop),
    /// or when the owning shard is gone.
    pub fn send<M: EntityMessage>(&mut self, msg: M) -> Result<(), SyncError> {
        if self.local_closed {
            return Err(SyncError::ChannelClosed);
        }
        let sent = self.shard.send(ShardMsg::Sync(SyncShardMsg::LocalFrame {
            from: self.owner,
            channel: self.local_channel,
            payload: Some(Box::new(msg)),
        }));
        if sent {
            Ok(())
        } else {
            Err(SyncError::ChannelClosed)
        }
    }

    /// Receive the next frame, expecting type `M`, with the default timeout.
    pub async fn receive<M: EntityMessage>(&mut self) -> Result<M, SyncError> {
        self.receive_with_timeout(DEFAULT_SYNC_RECEIVE_TIMEOUT).await
    }

    /// Receive the next frame, expecting type `M`.
    ///
    /// Frames buffered before the peer's EOF are drained first; after that,
    /// every receive fails with [`SyncError::ChannelClosed`]. A frame of the
    /// wrong type is consumed and surfaces [`SyncError::TypeMismatch`].
    pub async fn receive_with_timeout<M: EntityMessage>(&mut self, limit: Duration) -> Result<M, SyncError> {
        if self.remote_closed {
            return Err(SyncError::ChannelClosed);
        }
        match timeout(limit, self.reader.recv()).await {
            Err(_) => Err(SyncError::Timeout(limit)),
            // The hosting shard dropped the writer (peer or shard died).
            Ok(None) => {
                self.remote_closed = true;
                Err(SyncError::ChannelClosed)
            }
            Ok(Some(SyncFrame::Eof)) => {
                self.remote_closed = true;
                Err(SyncError::ChannelClosed)
            }
            Ok(Some(SyncFrame::Message(msg))) => Ok(downcast::<M>(msg)?),
        }
    }

    /// Half-close our direction by sending EOF. Idempotent; inbound frames
    /// remain receivable until the peer closes too.
    pub fn close(&mut self) {
        if !self.local_closed {
            self.local_closed = true;
            self.shard.send(ShardMsg::Sync(SyncShardMsg::LocalFrame {
                from: self.owner,
                channel: self.local_channel,
                payload: None,
            }));
        }
    }

    /// Drop the endpoint without emitting EOF; used when an open is
    /// rejected before the peer ever saw the channel.
    pub(crate) fn abandon(mut self) {
        self.local_closed = true;
        self.remote_closed = true;
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncChannel")
            .field("owner", &self.owner)
            .field("peer", &self.peer)
            .field("channel", &self.local_channel)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{EntityKind, ShardId};
    use tokio::sync::mpsc::unbounded_channel;

    const KIND: EntityKind = EntityKind::new(9, "Probe");

    fn harness() -> (SyncChannel, mpsc::UnboundedSender<SyncFrame>, mpsc::UnboundedReceiver<ShardMsg>) {
        let (shard_tx, shard_rx) = unbounded_channel();
        let shard = ShardRef::new(ShardId::new(KIND, 0), shard_tx);
        let (frame_tx, frame_rx) = unbounded_channel();
        let channel = SyncChannel::new(
            EntityId::new(KIND, 1),
            EntityId::new(KIND, 2),
            ChannelId(4),
            frame_rx,
            shard,
        );
        (channel, frame_tx, shard_rx)
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_then_eof_closes() {
        let (mut channel, frame_tx, _shard_rx) = harness();
        frame_tx.send(SyncFrame::Message(Box::new(1u32))).unwrap();
        frame_tx.send(SyncFrame::Message(Box::new(2u32))).unwrap();
        frame_tx.send(SyncFrame::Eof).unwrap();

        assert_eq!(channel.receive::<u32>().await.unwrap(), 1);
        assert_eq!(channel.receive::<u32>().await.unwrap(), 2);
        assert!(matches!(channel.receive::<u32>().await, Err(SyncError::ChannelClosed)));
        // And it stays closed.
        assert!(matches!(channel.receive::<u32>().await, Err(SyncError::ChannelClosed)));
        assert_eq!(channel.state(), SyncChannelState::RemoteClosed);
    }

    #[tokio::test]
    async fn test_receive_wrong_type_is_mismatch() {
        let (mut channel, frame_tx, _shard_rx) = harness();
        frame_tx.send(SyncFrame::Message(Box::new("text".to_string()))).unwrap();
        assert!(matches!(channel.receive::<u32>().await, Err(SyncError::TypeMismatch(_))));
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let (mut channel, _frame_tx, _shard_rx) = harness();
        let result = channel.receive_with_timeout::<u32>(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_send_after_close_errors_and_drop_sends_single_eof() {
        let (mut channel, _frame_tx, mut shard_rx) = harness();
        channel.send(7u32).unwrap();
        channel.close();
        assert!(matches!(channel.send(8u32), Err(SyncError::ChannelClosed)));
        drop(channel);

        // One payload frame, exactly one EOF.
        let mut eofs = 0;
        let mut payloads = 0;
        while let Ok(msg) = shard_rx.try_recv() {
            match msg {
                ShardMsg::Sync(SyncShardMsg::LocalFrame { payload: Some(_), .. }) => payloads += 1,
                ShardMsg::Sync(SyncShardMsg::LocalFrame { payload: None, .. }) => eofs += 1,
                _ => {}
            }
        }
        assert_eq!(payloads, 1);
        assert_eq!(eofs, 1);
    }

    #[tokio::test]
    async fn test_half_close_still_receives() {
        let (mut channel, frame_tx, _shard_rx) = harness();
        channel.close();
        assert_eq!(channel.state(), SyncChannelState::LocalClosed);
        frame_tx.send(SyncFrame::Message(Box::new(5u32))).unwrap();
        assert_eq!(channel.receive::<u32>().await.unwrap(), 5);
    }
}
