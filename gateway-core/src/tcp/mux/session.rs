//! Mux session dispatch loop (C8): demultiplexes frames onto per-stream
//! tasks, applies admission control on every `OPEN`, and keeps the
//! connection alive with idle `PING`/`PONG`.
//!
//! Transport-agnostic on purpose: [`MuxSession::run`] talks to its
//! caller only through `Bytes` in/out channels, so the `gateway` binary
//! can bridge real WebSocket frames in without this crate depending on
//! `actix-ws`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::admission::{AdmissionController, StreamKind};
use crate::error::{GatewayError, Result};

use super::frame::{Frame, FrameParser, OpenAckResult};
use super::stream::{self, StreamEvent, StreamHandle, StreamOutcome};
use crate::tcp::target::{self, ProxyContext};

#[derive(Debug, Clone)]
pub struct MuxSessionConfig {
    pub max_frame_payload_bytes: usize,
    pub max_streams_per_session: usize,
    pub our_initial_window: u32,
    pub idle_ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for MuxSessionConfig {
    fn default() -> Self {
        Self {
            max_frame_payload_bytes: super::frame::DEFAULT_MAX_FRAME_PAYLOAD_BYTES,
            max_streams_per_session: 64,
            our_initial_window: 256 * 1024,
            idle_ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

struct OpenStream {
    handle: StreamHandle,
    _admission: crate::admission::AdmissionGuard,
}

/// Runs one `/tcp-mux` connection end to end. Returns once `inbound` is
/// closed (the transport hung up) or a protocol violation tears the
/// session down.
pub struct MuxSession {
    config: MuxSessionConfig,
    client_ip: IpAddr,
    ctx: Arc<ProxyContext>,
    admission: Arc<AdmissionController>,
    streams: HashMap<u32, OpenStream>,
    stream_tasks: JoinSet<(u32, StreamOutcome)>,
    parser: FrameParser,
    frame_tx: mpsc::Sender<Frame>,
    frame_rx: mpsc::Receiver<Frame>,
    ping_nonce_counter: u64,
    pending_ping: Option<(u64, Instant)>,
}

impl MuxSession {
    pub fn new(client_ip: IpAddr, ctx: Arc<ProxyContext>, admission: Arc<AdmissionController>, config: MuxSessionConfig) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        Self {
            parser: FrameParser::new(config.max_frame_payload_bytes),
            config,
            client_ip,
            ctx,
            admission,
            streams: HashMap::new(),
            stream_tasks: JoinSet::new(),
            frame_tx,
            frame_rx,
            ping_nonce_counter: 0,
            pending_ping: None,
        }
    }

    pub async fn run(mut self, mut inbound: mpsc::Receiver<Bytes>, outbound: mpsc::Sender<Bytes>) -> Result<()> {
        let mut ping_ticker = tokio::time::interval(self.config.idle_ping_interval);
        ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                chunk = inbound.recv() => {
                    let Some(chunk) = chunk else { break };
                    let frames = match self.parser.feed(&chunk) {
                        Ok(frames) => frames,
                        Err(e) => {
                            log::debug!("mux session {}: protocol error, closing: {e}", self.client_ip);
                            break;
                        }
                    };
                    for frame in frames {
                        if self.dispatch(frame, &outbound).await.is_err() {
                            break;
                        }
                    }
                }

                Some(frame) = self.frame_rx.recv() => {
                    if !send_frame(&outbound, &frame).await {
                        break;
                    }
                }

                Some(joined) = self.stream_tasks.join_next() => {
                    if let Ok((stream_id, outcome)) = joined {
                        self.on_stream_finished(stream_id, outcome, &outbound).await;
                    }
                }

                _ = ping_ticker.tick() => {
                    if !self.send_idle_ping(&outbound).await {
                        break;
                    }
                    if self.ping_timed_out() {
                        log::debug!("mux session {}: pong timeout, closing", self.client_ip);
                        break;
                    }
                }
            }
        }

        self.streams.clear();
        while self.stream_tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame, outbound: &mpsc::Sender<Bytes>) -> Result<()> {
        match frame {
            Frame::Open {
                stream_id,
                host,
                port,
                initial_window,
            } => self.handle_open(stream_id, host, port, initial_window, outbound).await,
            Frame::OpenAck { .. } => Err(GatewayError::invalid_input("client sent OPEN_ACK; only the acceptor opens streams")),
            Frame::Data { stream_id, payload } => {
                self.forward_to_stream(stream_id, StreamEvent::Data(payload)).await;
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => {
                self.forward_to_stream(stream_id, StreamEvent::WindowUpdate(increment)).await;
                Ok(())
            }
            Frame::CloseWrite { stream_id } => {
                self.forward_to_stream(stream_id, StreamEvent::CloseWrite).await;
                Ok(())
            }
            Frame::Reset { stream_id, .. } => {
                self.forward_to_stream(stream_id, StreamEvent::Reset).await;
                Ok(())
            }
            Frame::Ping { nonce } => {
                send_frame(outbound, &Frame::Pong { nonce }).await;
                Ok(())
            }
            Frame::Pong { nonce } => {
                if self.pending_ping.map(|(n, _)| n) == Some(u64::from_be_bytes(nonce)) {
                    self.pending_ping = None;
                }
                Ok(())
            }
        }
    }

    async fn handle_open(
        &mut self,
        stream_id: u32,
        host: String,
        port: u16,
        initial_window: u32,
        outbound: &mpsc::Sender<Bytes>,
    ) -> Result<()> {
        if self.streams.contains_key(&stream_id) {
            send_frame(
                outbound,
                &Frame::OpenAck {
                    stream_id,
                    result: OpenAckResult::Err {
                        code: 1,
                        reason: "stream-id-in-use".into(),
                    },
                },
            )
            .await;
            return Ok(());
        }

        if self.streams.len() >= self.config.max_streams_per_session {
            send_frame(
                outbound,
                &Frame::OpenAck {
                    stream_id,
                    result: OpenAckResult::Err {
                        code: 2,
                        reason: "resource-exhausted".into(),
                    },
                },
            )
            .await;
            return Ok(());
        }

        let now_ms = Instant::now().elapsed().as_millis() as i64;
        let guard = match self.admission.try_admit(self.client_ip, StreamKind::Mux, now_ms) {
            Ok(guard) => guard,
            Err(_) => {
                send_frame(
                    outbound,
                    &Frame::OpenAck {
                        stream_id,
                        result: OpenAckResult::Err {
                            code: 2,
                            reason: "resource-exhausted".into(),
                        },
                    },
                )
                .await;
                return Ok(());
            }
        };

        let connected = target::resolve_and_connect(&host, port, self.client_ip, &self.ctx).await;
        let target_stream = match connected {
            Ok((stream, _target)) => stream,
            Err(e) => {
                let reason = match &e {
                    GatewayError::PolicyDenied(reason) => reason.as_str().to_string(),
                    other => other.kind().to_string(),
                };
                send_frame(
                    outbound,
                    &Frame::OpenAck {
                        stream_id,
                        result: OpenAckResult::Err { code: 3, reason },
                    },
                )
                .await;
                return Ok(());
            }
        };

        let (handle, join) = stream::spawn(
            stream_id,
            target_stream,
            initial_window,
            self.config.our_initial_window,
            self.frame_tx.clone(),
        );
        self.stream_tasks.spawn(async move { (stream_id, join.await.unwrap_or(StreamOutcome::Reset("stream task panicked".into()))) });
        self.streams.insert(
            stream_id,
            OpenStream {
                handle,
                _admission: guard,
            },
        );

        send_frame(
            outbound,
            &Frame::OpenAck {
                stream_id,
                result: OpenAckResult::Ok {
                    initial_window: self.config.our_initial_window,
                },
            },
        )
        .await;
        Ok(())
    }

    async fn forward_to_stream(&mut self, stream_id: u32, event: StreamEvent) {
        if let Some(open) = self.streams.get(&stream_id) {
            let _ = open.handle.events.send(event).await;
        }
    }

    async fn on_stream_finished(&mut self, stream_id: u32, outcome: StreamOutcome, outbound: &mpsc::Sender<Bytes>) {
        self.streams.remove(&stream_id);
        if let StreamOutcome::Reset(reason) = outcome {
            send_frame(
                outbound,
                &Frame::Reset {
                    stream_id,
                    code: 4,
                    reason,
                },
            )
            .await;
        }
    }

    async fn send_idle_ping(&mut self, outbound: &mpsc::Sender<Bytes>) -> bool {
        self.ping_nonce_counter += 1;
        let nonce = self.ping_nonce_counter;
        self.pending_ping = Some((nonce, Instant::now()));
        send_frame(outbound, &Frame::Ping { nonce: nonce.to_be_bytes() }).await
    }

    fn ping_timed_out(&self) -> bool {
        match self.pending_ping {
            Some((_, sent_at)) => sent_at.elapsed() > self.config.pong_timeout,
            None => false,
        }
    }
}

async fn send_frame(outbound: &mpsc::Sender<Bytes>, frame: &Frame) -> bool {
    outbound.send(Bytes::from(frame.encode())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::resolver::{DnsResolver, ResolverConfig};
    use crate::policy::EgressPolicy;
    use crate::tcp::proxy::DefaultSocketFactory;

    fn ctx(block_list: Vec<crate::policy::PolicyEntry>) -> Arc<ProxyContext> {
        Arc::new(ProxyContext {
            policy: EgressPolicy {
                require_dns_name: false,
                allow_private_ips: true,
                block_list,
                allow_list: vec![],
            },
            resolver: Arc::new(DnsResolver::new(ResolverConfig {
                upstreams: vec![],
                upstream_timeout: Duration::from_millis(50),
                max_query_bytes: 512,
                max_response_bytes: 4096,
                allow_any_qtype: false,
                allow_private_answers: true,
                allow_private_ptr: false,
                cache_max_entries: 100,
                cache_max_ttl: Duration::from_secs(60),
                cache_negative_ttl: Duration::from_secs(10),
                qps_per_ip: 1000,
                burst_per_ip: 1000,
            })),
            socket_factory: Arc::new(DefaultSocketFactory),
            connect_timeout: Duration::from_millis(500),
        })
    }

    #[tokio::test]
    async fn open_to_blocked_host_yields_error_ack_without_a_stream() {
        let admission = AdmissionController::new(crate::admission::AdmissionLimits {
            max_global: 0,
            max_per_ip: 0,
        });
        let context = ctx(vec![crate::policy::parse_policy_entry("blocked.example").unwrap()]);
        let session = MuxSession::new("203.0.113.9".parse().unwrap(), context, admission, MuxSessionConfig::default());

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);

        let open = Frame::Open {
            stream_id: 1,
            host: "blocked.example".into(),
            port: 80,
            initial_window: 1024,
        };
        inbound_tx.send(Bytes::from(open.encode())).await.unwrap();
        drop(inbound_tx);

        let run = tokio::spawn(session.run(inbound_rx, outbound_tx));

        let mut parser = FrameParser::new(super::super::frame::DEFAULT_MAX_FRAME_PAYLOAD_BYTES);
        let mut saw_err_ack = false;
        while let Some(bytes) = outbound_rx.recv().await {
            for frame in parser.feed(&bytes).unwrap() {
                if let Frame::OpenAck {
                    result: OpenAckResult::Err { .. },
                    ..
                } = frame
                {
                    saw_err_ack = true;
                }
            }
            if saw_err_ack {
                break;
            }
        }
        assert!(saw_err_ack);
        let _ = run.await;
    }
}
