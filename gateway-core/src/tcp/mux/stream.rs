//! Per-stream state machine and credit-based flow control (C8).
//!
//! Each accepted stream gets its own task pair: a reader half that
//! drains the target socket and turns bytes into outbound `DATA`
//! frames (throttled by `send_window`), and a writer half that applies
//! inbound frames (`DATA`, `WINDOW_UPDATE`, `CLOSE_WRITE`, `RESET`) to
//! the target socket. The two halves only share a [`FlowWindow`] and a
//! [`StreamStateCell`] — no locks are held across an `.await`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use super::frame::Frame;

/// Chunk size the reader half reads from the target socket at once,
/// capped by whatever send credit remains.
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// A `WINDOW_UPDATE` is emitted once at least this fraction of the
/// granted window (or `WINDOW_UPDATE_MIN_INCREMENT`, whichever is
/// reached first) has been delivered downstream.
const WINDOW_UPDATE_MIN_INCREMENT: u32 = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Shared, lock-protected stream state. Plain `Mutex` rather than
/// atomics: transitions are rare (a handful per stream lifetime) and
/// every critical section is non-blocking, so contention is a non-issue.
pub struct StreamStateCell(Mutex<StreamState>);

impl StreamStateCell {
    fn new() -> Self {
        Self(Mutex::new(StreamState::Open))
    }

    pub fn get(&self) -> StreamState {
        *self.0.lock().unwrap()
    }

    /// Apply a local-EOF (we have no more to send) or remote-close
    /// (peer has no more to send) transition, returning the new state.
    fn close_local(&self) -> StreamState {
        let mut guard = self.0.lock().unwrap();
        *guard = match *guard {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        *guard
    }

    fn close_remote(&self) -> StreamState {
        let mut guard = self.0.lock().unwrap();
        *guard = match *guard {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        *guard
    }

    fn force_closed(&self) {
        *self.0.lock().unwrap() = StreamState::Closed;
    }
}

/// Credit accounting shared between a stream's reader and writer
/// halves and the session that dispatches frames to it.
pub struct FlowWindow {
    /// Our remaining allowance to send `DATA` to the peer.
    send_window: AtomicI64,
    /// The allowance we've granted the peer to send `DATA` to us.
    recv_window: AtomicI64,
    send_credit_available: Notify,
}

impl FlowWindow {
    pub fn new(initial_send_window: u32, initial_recv_window: u32) -> Self {
        Self {
            send_window: AtomicI64::new(initial_send_window as i64),
            recv_window: AtomicI64::new(initial_recv_window as i64),
            send_credit_available: Notify::new(),
        }
    }

    pub fn send_window(&self) -> i64 {
        self.send_window.load(Ordering::Acquire)
    }

    pub fn recv_window(&self) -> i64 {
        self.recv_window.load(Ordering::Acquire)
    }

    fn consume_send(&self, n: usize) {
        self.send_window.fetch_sub(n as i64, Ordering::AcqRel);
    }

    /// Peer sent `WINDOW_UPDATE{n}`: we may send `n` more bytes.
    pub fn grant_send_credit(&self, n: u32) {
        self.send_window.fetch_add(n as i64, Ordering::AcqRel);
        self.send_credit_available.notify_waiters();
    }

    async fn wait_for_send_credit(&self) {
        loop {
            if self.send_window() > 0 {
                return;
            }
            self.send_credit_available.notified().await;
        }
    }

    /// Account for an inbound `DATA` frame of `n` bytes against the
    /// window we granted the peer. Returns `false` if the peer ignored
    /// our advertised window (flow-control violation) — the caller
    /// must RESET the stream.
    pub fn consume_recv(&self, n: usize) -> bool {
        let remaining = self.recv_window.fetch_sub(n as i64, Ordering::AcqRel) - n as i64;
        remaining >= 0
    }

    /// We delivered `n` bytes downstream: re-grant that much credit to
    /// the peer and report whether a `WINDOW_UPDATE` should be emitted
    /// now (coalesced: only once `WINDOW_UPDATE_MIN_INCREMENT`-ish
    /// bytes have accumulated since the last one).
    fn grant_recv_credit(&self, n: u32) {
        self.recv_window.fetch_add(n as i64, Ordering::AcqRel);
    }
}

/// A decoded inbound frame already routed to one stream by the session.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Bytes),
    WindowUpdate(u32),
    CloseWrite,
    Reset,
}

/// Why a stream task ended, reported back to the session so it can
/// release the stream's admission slot and, if needed, tell the peer.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Both directions reached a clean close; nothing further to send.
    Closed,
    /// The target socket (or the stream itself) errored; the session
    /// should emit `RESET` with this reason if it hasn't already.
    Reset(String),
}

/// A running stream's handle, held by the session.
pub struct StreamHandle {
    pub events: mpsc::Sender<StreamEvent>,
    pub flow: Arc<FlowWindow>,
    pub state: Arc<StreamStateCell>,
}

/// Spawn the reader/writer task pair for one stream and return the
/// handle the session uses to route frames to it, plus a future that
/// resolves to the stream's outcome when both halves are done.
pub fn spawn(
    stream_id: u32,
    target: TcpStream,
    initial_send_window: u32,
    initial_recv_window: u32,
    frame_tx: mpsc::Sender<Frame>,
) -> (StreamHandle, tokio::task::JoinHandle<StreamOutcome>) {
    let flow = Arc::new(FlowWindow::new(initial_send_window, initial_recv_window));
    let state = Arc::new(StreamStateCell::new());
    let cancel = Arc::new(Notify::new());
    let (events_tx, events_rx) = mpsc::channel(256);

    let (target_read, target_write) = target.into_split();

    let reader = tokio::spawn(reader_loop(
        stream_id,
        target_read,
        Arc::clone(&flow),
        Arc::clone(&state),
        frame_tx.clone(),
        Arc::clone(&cancel),
    ));
    let writer = tokio::spawn(writer_loop(
        stream_id,
        target_write,
        Arc::clone(&flow),
        Arc::clone(&state),
        frame_tx,
        events_rx,
        Arc::clone(&cancel),
    ));

    let handle = StreamHandle {
        events: events_tx,
        flow: Arc::clone(&flow),
        state: Arc::clone(&state),
    };

    let join = tokio::spawn(async move {
        let (reader_result, writer_result) = tokio::join!(reader, writer);
        match (reader_result, writer_result) {
            (Ok(Err(reason)), _) | (_, Ok(Err(reason))) => StreamOutcome::Reset(reason),
            (Err(e), _) | (_, Err(e)) => StreamOutcome::Reset(format!("stream task panicked: {e}")),
            (Ok(Ok(())), Ok(Ok(()))) => StreamOutcome::Closed,
        }
    });

    (handle, join)
}

async fn reader_loop(
    stream_id: u32,
    mut target_read: tokio::net::tcp::OwnedReadHalf,
    flow: Arc<FlowWindow>,
    state: Arc<StreamStateCell>,
    frame_tx: mpsc::Sender<Frame>,
    cancel: Arc<Notify>,
) -> Result<(), String> {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        flow.wait_for_send_credit().await;
        let budget = (flow.send_window().max(0) as usize).min(READ_CHUNK_BYTES);

        let read_result = tokio::select! {
            biased;
            _ = cancel.notified() => return Ok(()),
            result = target_read.read(&mut buf[..budget.max(1)]) => result,
        };

        match read_result {
            Ok(0) => {
                state.close_local();
                let _ = frame_tx.send(Frame::CloseWrite { stream_id }).await;
                return Ok(());
            }
            Ok(n) => {
                flow.consume_send(n);
                let payload = Bytes::copy_from_slice(&buf[..n]);
                if frame_tx.send(Frame::Data { stream_id, payload }).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                cancel.notify_waiters();
                return Err(format!("target read error: {e}"));
            }
        }
    }
}

async fn writer_loop(
    stream_id: u32,
    mut target_write: tokio::net::tcp::OwnedWriteHalf,
    flow: Arc<FlowWindow>,
    state: Arc<StreamStateCell>,
    frame_tx: mpsc::Sender<Frame>,
    mut events_rx: mpsc::Receiver<StreamEvent>,
    cancel: Arc<Notify>,
) -> Result<(), String> {
    let mut delivered_since_update: u32 = 0;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.notified() => {
                let _ = target_write.shutdown().await;
                return Ok(());
            }
            event = events_rx.recv() => event,
        };

        let Some(event) = event else {
            let _ = target_write.shutdown().await;
            return Ok(());
        };

        match event {
            StreamEvent::Data(payload) => {
                let n = payload.len();
                if !flow.consume_recv(n) {
                    cancel.notify_waiters();
                    let _ = frame_tx
                        .send(Frame::Reset {
                            stream_id,
                            code: 1,
                            reason: "flow-control-violation".into(),
                        })
                        .await;
                    return Err("peer exceeded advertised receive window".into());
                }
                if let Err(e) = target_write.write_all(&payload).await {
                    cancel.notify_waiters();
                    return Err(format!("target write error: {e}"));
                }
                delivered_since_update += n as u32;
                let half_window = (flow.recv_window().max(0) as u32) / 2;
                if delivered_since_update >= WINDOW_UPDATE_MIN_INCREMENT || delivered_since_update >= half_window.max(1) {
                    flow_grant_and_emit(stream_id, &flow, &frame_tx, delivered_since_update).await;
                    delivered_since_update = 0;
                }
            }
            StreamEvent::WindowUpdate(increment) => {
                flow.grant_send_credit(increment);
            }
            StreamEvent::CloseWrite => {
                state.close_remote();
                let _ = target_write.shutdown().await;
                if state.get() == StreamState::Closed {
                    return Ok(());
                }
            }
            StreamEvent::Reset => {
                state.force_closed();
                cancel.notify_waiters();
                return Ok(());
            }
        }
    }
}

async fn flow_grant_and_emit(stream_id: u32, flow: &FlowWindow, frame_tx: &mpsc::Sender<Frame>, increment: u32) {
    flow.grant_recv_credit(increment);
    let _ = frame_tx.send(Frame::WindowUpdate { stream_id, increment }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_never_goes_negative_after_consuming_exactly_available_credit() {
        let flow = FlowWindow::new(100, 100);
        flow.consume_send(100);
        assert_eq!(flow.send_window(), 0);
    }

    #[test]
    fn grant_send_credit_replenishes_window() {
        let flow = FlowWindow::new(0, 0);
        flow.grant_send_credit(64);
        assert_eq!(flow.send_window(), 64);
    }

    #[test]
    fn consume_recv_detects_violation_when_peer_exceeds_window() {
        let flow = FlowWindow::new(0, 10);
        assert!(flow.consume_recv(5));
        assert!(!flow.consume_recv(10), "consuming past the granted window must report a violation");
    }

    #[test]
    fn state_transitions_follow_the_half_close_lattice() {
        let state = StreamStateCell::new();
        assert_eq!(state.close_local(), StreamState::HalfClosedLocal);
        assert_eq!(state.close_remote(), StreamState::Closed);

        let state = StreamStateCell::new();
        assert_eq!(state.close_remote(), StreamState::HalfClosedRemote);
        assert_eq!(state.close_local(), StreamState::Closed);
    }

    #[tokio::test]
    async fn stream_conserves_bytes_in_both_directions() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpStream::connect(addr);
        let (accepted, target) = tokio::join!(listener.accept(), connector);
        let (mut remote, _) = accepted.unwrap();
        let target = target.unwrap();

        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let (handle, join) = spawn(1, target, 1024, 1024, frame_tx);

        remote.write_all(b"from target").await.unwrap();

        let mut saw_data = false;
        while let Some(frame) = frame_rx.recv().await {
            if let Frame::Data { payload, .. } = frame {
                assert_eq!(&payload[..], b"from target");
                saw_data = true;
                break;
            }
        }
        assert!(saw_data);

        handle
            .events
            .send(StreamEvent::Data(Bytes::from_static(b"to target")))
            .await
            .unwrap();
        let mut buf = vec![0u8; 32];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"to target");

        drop(remote);
        drop(handle.events);
        let _ = join.await;
    }
}
