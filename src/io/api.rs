//! HTTP control surface and WebSocket snapshot stream
//!
//! hyper 1 HTTP/1.1 server. Every response carries a permissive CORS header
//! and any path answers an OPTIONS preflight. `GET /ws` upgrades to a
//! WebSocket that receives one JSON snapshot per publish interval.

use crate::domain::types::{PresenceSnapshot, TagId};
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::control::{ControlSurface, ReconfigureRequest};
use crate::services::publisher::PresencePublisher;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Request bodies are small JSON documents
const MAX_BODY_BYTES: usize = 64 * 1024;

const JSON: &str = "application/json";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

/// Shared state handed to every connection
#[derive(Clone)]
pub struct ApiContext {
    control: ControlSurface,
    publisher: PresencePublisher,
}

impl ApiContext {
    pub fn new(control: ControlSurface, publisher: PresencePublisher) -> Self {
        Self { control, publisher }
    }

    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    fn snapshot(&self) -> PresenceSnapshot {
        self.control.tracker().snapshot(SystemTime::now())
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    tag_id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct RenameResponse<'a> {
    status: &'static str,
    tag_id: &'a str,
    name: &'a str,
}

fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, JSON, body),
        Err(e) => {
            error!(error = %e, "api_serialize_failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed")
        }
    }
}

fn detail(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "detail": message }))
}

fn preflight() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .body(Full::new(Bytes::new()))
        .expect("static response should not fail")
}

/// Parse a JSON body, mapping failures to a 400 response
fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, Response<Full<Bytes>>> {
    serde_json::from_slice(body).map_err(|e| detail(StatusCode::BAD_REQUEST, &e.to_string()))
}

/// Dispatch a fully-read request
pub async fn route(
    method: &Method,
    path: &str,
    body: Bytes,
    ctx: &ApiContext,
) -> Response<Full<Bytes>> {
    if *method == Method::OPTIONS {
        return preflight();
    }

    match (method, path) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, &json!({ "status": "ok" })),
        (&Method::GET, "/status") => json_response(StatusCode::OK, &ctx.snapshot()),
        (&Method::GET, "/metrics") => {
            let snapshot = ctx.snapshot();
            let body = format_prometheus_metrics(ctx.control.tracker().metrics(), &snapshot);
            response(StatusCode::OK, PROMETHEUS_TEXT, body)
        }
        (&Method::GET, "/ws") => {
            detail(StatusCode::UPGRADE_REQUIRED, "Expected a WebSocket upgrade request")
        }
        (&Method::POST, "/start") => {
            let request = if body.iter().all(u8::is_ascii_whitespace) {
                StartRequest::default()
            } else {
                match parse_body::<StartRequest>(&body) {
                    Ok(request) => request,
                    Err(resp) => return resp,
                }
            };
            ctx.control.start(request.ip).await;
            json_response(StatusCode::OK, &json!({ "status": "started" }))
        }
        (&Method::POST, "/stop") => {
            ctx.control.stop().await;
            json_response(StatusCode::OK, &json!({ "status": "stopped" }))
        }
        (&Method::POST, "/config") => {
            let request = match parse_body::<ReconfigureRequest>(&body) {
                Ok(request) => request,
                Err(resp) => return resp,
            };
            match ctx.control.reconfigure(&request).await {
                Ok(applied) => json_response(
                    StatusCode::OK,
                    &json!({ "status": "updated", "config": applied }),
                ),
                Err(e) => detail(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        (&Method::POST, "/tag/name") => {
            let request = match parse_body::<RenameRequest>(&body) {
                Ok(request) => request,
                Err(resp) => return resp,
            };
            if ctx.control.rename(&TagId::from(request.tag_id.as_str()), &request.name) {
                json_response(
                    StatusCode::OK,
                    &RenameResponse {
                        status: "success",
                        tag_id: &request.tag_id,
                        name: &request.name,
                    },
                )
            } else {
                detail(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update tag name")
            }
        }
        _ => detail(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    upgrade && req.headers().contains_key(SEC_WEBSOCKET_KEY)
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if *req.method() == Method::GET && req.uri().path() == "/ws" && is_websocket_upgrade(&req) {
        return Ok(accept_websocket(&mut req, ctx));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(path = %path, error = %e, "api_body_rejected");
            return Ok(detail(StatusCode::PAYLOAD_TOO_LARGE, "Request body rejected"));
        }
    };

    debug!(method = %method, path = %path, "api_request");
    Ok(route(&method, &path, body, &ctx).await)
}

/// Answer the handshake and hand the upgraded connection to a stream task
fn accept_websocket(req: &mut Request<Incoming>, ctx: Arc<ApiContext>) -> Response<Full<Bytes>> {
    let Some(accept) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
    else {
        return detail(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
    };
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        return detail(StatusCode::BAD_REQUEST, "Invalid Sec-WebSocket-Key");
    };

    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                stream_snapshots(ws, ctx.publisher.clone()).await;
            }
            Err(e) => warn!(error = %e, "websocket_upgrade_failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .expect("static response should not fail")
}

/// Forward published snapshots until either side goes away
async fn stream_snapshots<S>(ws: WebSocketStream<S>, publisher: PresencePublisher)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<PresenceSnapshot>(1);
    let pusher = tokio::spawn(async move { publisher.serve(tx).await });

    info!("websocket_subscriber_connected");
    loop {
        tokio::select! {
            snapshot = rx.recv() => {
                let Some(snapshot) = snapshot else { break };
                let text = match serde_json::to_string(&snapshot) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "websocket_serialize_failed");
                        break;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    debug!(error = %e, "websocket_write_failed");
                    break;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket_read_failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    drop(rx);
    let _ = pusher.await;
    info!("websocket_subscriber_disconnected");
}

/// Serve the API on an already-bound listener until shutdown
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ApiContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let ctx = Arc::clone(&ctx);

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = Arc::clone(&ctx);
                                async move { handle_request(req, ctx).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!(peer = %peer, error = %e, "api_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind and serve the API
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    ctx: Arc<ApiContext>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind_address}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, "api_server_started");
    serve(listener, ctx, shutdown).await
}
