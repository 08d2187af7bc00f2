//! Transport seam between the coordinator and replicas.
//!
//! A connection is a reliable, ordered, bidirectional frame stream to one
//! replica of one block. Frames are opaque bytes here; the coordinator and
//! the replica encode and decode them with the packet format from
//! `cascade-durability`. Connection loss and deadlines surface as a
//! `PipelineFailure` so the coordinator can attribute them to a replica.

use cascade_core::{NodeId, PipelineFailure};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Ordered frame stream to one replica
pub trait ReplicaConnection: Send {
    /// Node at the far end of the connection
    fn node(&self) -> NodeId;

    /// Queue a frame for the replica.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), PipelineFailure>;

    /// Wait for the next frame from the replica until `deadline`.
    ///
    /// A frame already queued is returned even if the deadline has passed.
    fn recv(&mut self, deadline: Instant) -> Result<Vec<u8>, PipelineFailure>;
}

/// In-process connection backed by a pair of channels and a receiver thread
/// on the replica side.
pub struct LocalConnection {
    node: NodeId,
    outbound: Option<Sender<Vec<u8>>>,
    inbound: Receiver<Vec<u8>>,
    receiver: Option<JoinHandle<()>>,
}

impl LocalConnection {
    pub(crate) fn new(
        node: NodeId,
        outbound: Sender<Vec<u8>>,
        inbound: Receiver<Vec<u8>>,
        receiver: JoinHandle<()>,
    ) -> Self {
        LocalConnection {
            node,
            outbound: Some(outbound),
            inbound,
            receiver: Some(receiver),
        }
    }

    /// Whether the replica-side receiver thread is still running
    pub fn is_open(&self) -> bool {
        self.receiver
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl ReplicaConnection for LocalConnection {
    fn node(&self) -> NodeId {
        self.node
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), PipelineFailure> {
        match &self.outbound {
            Some(tx) => tx.send(frame).map_err(|_| PipelineFailure::Unreachable),
            None => Err(PipelineFailure::Unreachable),
        }
    }

    fn recv(&mut self, deadline: Instant) -> Result<Vec<u8>, PipelineFailure> {
        match self.inbound.try_recv() {
            Ok(frame) => return Ok(frame),
            Err(TryRecvError::Disconnected) => return Err(PipelineFailure::Unreachable),
            Err(TryRecvError::Empty) => {}
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PipelineFailure::TimedOut {
                waited: Duration::ZERO,
            });
        }
        self.inbound.recv_timeout(remaining).map_err(|e| match e {
            RecvTimeoutError::Timeout => PipelineFailure::TimedOut { waited: remaining },
            RecvTimeoutError::Disconnected => PipelineFailure::Unreachable,
        })
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        // Closing the outbound channel ends the receiver thread once it has
        // drained what was queued. It is not joined: a stalled replica may
        // hold it for a long time.
        self.outbound.take();
        self.receiver.take();
    }
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("node", &self.node)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::thread;

    fn echo() -> LocalConnection {
        let (out_tx, out_rx) = channel::<Vec<u8>>();
        let (in_tx, in_rx) = channel::<Vec<u8>>();
        let handle = thread::spawn(move || {
            for frame in out_rx {
                if frame.is_empty() {
                    continue;
                }
                if in_tx.send(frame).is_err() {
                    return;
                }
            }
        });
        LocalConnection::new(NodeId(9), out_tx, in_rx, handle)
    }

    #[test]
    fn test_send_and_recv() {
        let mut conn = echo();
        conn.send(b"ping".to_vec()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(conn.recv(deadline).unwrap(), b"ping".to_vec());
        assert_eq!(conn.node(), NodeId(9));
    }

    #[test]
    fn test_recv_times_out() {
        let mut conn = echo();
        conn.send(Vec::new()).unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            conn.recv(deadline),
            Err(PipelineFailure::TimedOut { .. })
        ));
    }

    #[test]
    fn test_closed_peer_is_unreachable() {
        let (out_tx, _) = channel::<Vec<u8>>();
        let (in_tx, in_rx) = channel::<Vec<u8>>();
        drop(in_tx);
        let mut conn = LocalConnection::new(NodeId(1), out_tx, in_rx, thread::spawn(|| {}));
        assert_eq!(
            conn.send(vec![1]).unwrap_err(),
            PipelineFailure::Unreachable
        );
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(conn.recv(deadline).unwrap_err(), PipelineFailure::Unreachable);
    }
}
