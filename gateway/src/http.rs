//! Route handlers: the plain-HTTP surface from spec §6 plus the two
//! WebSocket upgrade endpoints (`/tcp`, `/tcp-mux`).
//!
//! Grounded on `shelter::commands::http`'s actix-web handler shape
//! (`web::Data<...>` state, a handler per route returning
//! `actix_web::Result<HttpResponse>`), generalized from that single
//! exfiltration endpoint to this gateway's full endpoint table.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use futures_util::StreamExt;
use hickory_resolver::proto::op::Message as DnsMessage;
use hickory_resolver::proto::rr::{Name, RecordType};
use hickory_resolver::proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use gateway_core::admission::StreamKind;
use gateway_core::dns::codec;
use gateway_core::tcp::mux::MuxSession;
use gateway_core::tcp::{proxy, target};

use crate::error::{ws_close_code, HttpError};
use crate::state::AppState;
use crate::upgrade;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn close_code_for(code: u16) -> actix_ws::CloseCode {
    match code {
        1007 => actix_ws::CloseCode::Invalid,
        1008 => actix_ws::CloseCode::Policy,
        1009 => actix_ws::CloseCode::Size,
        1013 => actix_ws::CloseCode::Again,
        _ => actix_ws::CloseCode::Error,
    }
}

pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"ok": true}))
}

pub async fn readyz(state: web::Data<Arc<AppState>>) -> HttpResponse {
    if state.is_shutting_down() {
        HttpResponse::ServiceUnavailable().body("shutting down")
    } else {
        HttpResponse::Ok().body("ready")
    }
}

pub async fn version() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("GIT_COMMIT_HASH").unwrap_or("unknown"),
    }))
}

/// `POST /session`: hands the client the absolute upgrade URLs it
/// should dial next. Stateless — there is no server-side session
/// record, just a convenience for clients that don't want to build the
/// URLs themselves. `l2` is reserved for an Ethernet-over-WebSocket
/// tunnel this gateway doesn't implement, so it's left out rather than
/// advertised as a dead route.
pub async fn create_session(req: HttpRequest, state: web::Data<Arc<AppState>>) -> Result<HttpResponse, HttpError> {
    upgrade::check_preconditions(&state, &req)?;
    let base = state.public_base_url.trim_end_matches('/');
    Ok(HttpResponse::Created().json(serde_json::json!({
        "endpoints": {
            "tcp": format!("{base}/tcp"),
            "tcp-mux": format!("{base}/tcp-mux"),
        },
    })))
}

pub async fn metrics(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(state.render_metrics())
}

fn parse_record_type(raw: &str) -> Result<RecordType, HttpError> {
    if let Ok(code) = raw.parse::<u16>() {
        return Ok(RecordType::from(code));
    }
    RecordType::from_str(&raw.to_ascii_uppercase()).map_err(|_| HttpError::bad_request(format!("unknown record type {raw:?}")))
}

pub async fn dns_query_get(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, HttpError> {
    state.record_http_request();

    let dns_param = query.get("dns").ok_or_else(|| HttpError::bad_request("missing dns parameter"))?;
    let query_bytes = codec::parse_doh_get_param(dns_param, state.proxy_ctx.resolver.max_query_bytes())?;
    let client_ip = state.client_ip_of(&req);
    let response_bytes = state.proxy_ctx.resolver.resolve(&query_bytes, client_ip).await?;

    Ok(HttpResponse::Ok().content_type("application/dns-message").body(response_bytes))
}

pub async fn dns_query_post(req: HttpRequest, body: web::Bytes, state: web::Data<Arc<AppState>>) -> Result<HttpResponse, HttpError> {
    state.record_http_request();

    if body.len() > state.proxy_ctx.resolver.max_query_bytes() {
        return Err(HttpError::bad_request("malformed-query: query exceeds DNS_MAX_QUERY_BYTES"));
    }
    let client_ip = state.client_ip_of(&req);
    let response_bytes = state.proxy_ctx.resolver.resolve(&body, client_ip).await?;

    Ok(HttpResponse::Ok().content_type("application/dns-message").body(response_bytes))
}

/// Google/Cloudflare-compatible `/dns-json`: builds a one-question wire
/// query from `name=`/`type=`, forwards it through the same resolver
/// pipeline `/dns-query` uses, and re-renders the wire response as
/// JSON. No separate cache or policy path — both façades share C4/C5.
pub async fn dns_json(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, HttpError> {
    state.record_http_request();

    let name = query.get("name").ok_or_else(|| HttpError::bad_request("missing name parameter"))?;
    let qtype = parse_record_type(query.get("type").map(String::as_str).unwrap_or("A"))?;
    let qname = Name::from_str(name).map_err(|e| HttpError::bad_request(format!("malformed name: {e}")))?;

    let query_bytes = codec::build_simple_query(0, &qname, qtype)?;
    let client_ip = state.client_ip_of(&req);
    let response_bytes = state.proxy_ctx.resolver.resolve(&query_bytes, client_ip).await?;

    let message = DnsMessage::from_bytes(&response_bytes)
        .map_err(|e| HttpError::new(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, format!("malformed response: {e}")))?;

    let question = message.queries().first().map(|q| {
        serde_json::json!({
            "name": q.name().to_ascii(),
            "type": u16::from(q.query_type()),
        })
    });
    let answers: Vec<serde_json::Value> = message
        .answers()
        .iter()
        .map(|record| {
            serde_json::json!({
                "name": record.name().to_ascii(),
                "type": u16::from(record.record_type()),
                "TTL": record.ttl(),
                "data": record.data().to_string(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().content_type("application/json").json(serde_json::json!({
        "Status": u16::from(message.response_code()),
        "TC": message.truncated(),
        "RD": message.recursion_desired(),
        "RA": message.recursion_available(),
        "AD": message.authentic_data(),
        "CD": message.checking_disabled(),
        "Question": question.into_iter().collect::<Vec<_>>(),
        "Answer": answers,
    })))
}

/// `GET /tcp?target=host:port` (or `?host=&port=`): one WebSocket
/// frame per byte chunk, bridged onto a plain TCP connection through
/// [`proxy::relay_full_duplex`] via an in-process duplex pipe so the
/// idle/total timeout and half-close logic stays in one place for both
/// this tunnel and the mux streams' per-stream pumps.
pub async fn tcp_tunnel(
    req: HttpRequest,
    body: web::Payload,
    query: web::Query<HashMap<String, String>>,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, HttpError> {
    upgrade::check_preconditions(&state, &req)?;
    let (host, port) = upgrade::parse_tcp_target(&query)?;
    let client_ip = state.client_ip_of(&req);

    let (response, session, mut msg_stream) =
        actix_ws::handle(&req, body).map_err(|e| HttpError::bad_request(format!("websocket handshake failed: {e}")))?;

    let guard = match state.admission.try_admit(client_ip, StreamKind::Tcp, now_ms()) {
        Ok(guard) => guard,
        Err(err) => {
            let code = ws_close_code(&err);
            actix_web::rt::spawn(async move {
                let _ = session
                    .close(Some(actix_ws::CloseReason {
                        code: close_code_for(code),
                        description: Some(err.to_string()),
                    }))
                    .await;
            });
            return Ok(response);
        }
    };

    let ctx = Arc::clone(&state.proxy_ctx);
    let idle_timeout = state.tcp_idle_timeout;
    let total_timeout = state.tcp_total_timeout;

    actix_web::rt::spawn(async move {
        let _guard = guard;
        match target::resolve_and_connect(&host, port, client_ip, &ctx).await {
            Ok((target_stream, _target)) => {
                bridge_tcp_tunnel(session, msg_stream, target_stream, idle_timeout, total_timeout).await;
            }
            Err(err) => {
                let code = ws_close_code(&err);
                let _ = session
                    .close(Some(actix_ws::CloseReason {
                        code: close_code_for(code),
                        description: Some(err.to_string()),
                    }))
                    .await;
                while msg_stream.next().await.is_some() {}
            }
        }
    });

    Ok(response)
}

async fn bridge_tcp_tunnel(
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    target_stream: tokio::net::TcpStream,
    idle_timeout: Duration,
    total_timeout: Option<Duration>,
) {
    let (relay_side, mut ws_side) = tokio::io::duplex(64 * 1024);
    let relay = tokio::spawn(async move { proxy::relay_full_duplex(relay_side, target_stream, idle_timeout, total_timeout).await });

    let mut read_buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(actix_ws::Message::Binary(bytes))) => {
                        if ws_side.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(actix_ws::Message::Text(text))) => {
                        if ws_side.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(actix_ws::Message::Ping(bytes))) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Some(Ok(actix_ws::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            read = ws_side.read(&mut read_buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if session.binary(Bytes::copy_from_slice(&read_buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    drop(ws_side);
    let _ = session.close(None).await;
    let _ = relay.await;
}

/// `/tcp-mux`: every WS binary message is one mux frame in, every mux
/// frame the session emits is one WS binary message out. No duplex
/// pipe needed here — [`MuxSession::run`] already speaks `Bytes`
/// channels, so the bridge is a plain forwarding loop.
pub async fn tcp_mux_tunnel(req: HttpRequest, body: web::Payload, state: web::Data<Arc<AppState>>) -> Result<HttpResponse, HttpError> {
    upgrade::check_preconditions(&state, &req)?;
    let client_ip = state.client_ip_of(&req);

    let (response, mut session, mut msg_stream) =
        actix_ws::handle(&req, body).map_err(|e| HttpError::bad_request(format!("websocket handshake failed: {e}")))?;

    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(64);

    let mux_session = MuxSession::new(client_ip, Arc::clone(&state.proxy_ctx), Arc::clone(&state.admission), state.mux_config.clone());
    actix_web::rt::spawn(async move {
        let _ = mux_session.run(inbound_rx, outbound_tx).await;
    });

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                msg = msg_stream.next() => {
                    match msg {
                        Some(Ok(actix_ws::Message::Binary(bytes))) => {
                            if inbound_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(actix_ws::Message::Ping(bytes))) => {
                            let _ = session.pong(&bytes).await;
                        }
                        Some(Ok(actix_ws::Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(bytes) => {
                            if session.binary(bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = session.close(None).await;
    });

    Ok(response)
}

pub async fn not_found() -> Result<HttpResponse, HttpError> {
    Err(HttpError::not_found("no such route"))
}
