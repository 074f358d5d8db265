//! HTTP ingress endpoint.
//!
//! Serves three routes below the node's service path:
//!
//! | Route          | Handler                                  |
//! |----------------|------------------------------------------|
//! | `GET /ping`    | [`IngressDispatcher::ping`] as JSON bool |
//! | `POST /event`  | [`IngressDispatcher::handle_inbound`]    |
//! | `GET /status`  | [`PeerMembership::status`] as JSON       |
//!
//! `POST /event` answers `202 Accepted` for any well-formed event; routing
//! outcomes are never reported to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use gridfed_core::{IngressDispatcher, PeerMembership, RemoteEvent};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::transport::{EVENT_PATH, PING_PATH, STATUS_PATH};

/// Largest accepted event body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    ingress: Arc<IngressDispatcher>,
    membership: Arc<PeerMembership>,
    base_path: Arc<str>,
}

/// A bound, not yet serving, ingress listener.
#[derive(Debug)]
pub struct IngressServer {
    listener: TcpListener,
    base_path: String,
}

impl IngressServer {
    /// Binds `addr`. Endpoints are served below `base_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, base_path: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let base_path = base_path.into().trim_end_matches('/').to_string();
        Ok(Self {
            listener,
            base_path,
        })
    }

    /// The bound address (useful when binding to port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until `shutdown` flips to true.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener address cannot be read.
    pub async fn serve(
        self,
        ingress: Arc<IngressDispatcher>,
        membership: Arc<PeerMembership>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let addr = self.listener.local_addr()?;
        let state = AppState {
            ingress,
            membership,
            base_path: Arc::from(self.base_path.as_str()),
        };
        info!(addr = %addr, base_path = %self.base_path, "ingress listening");

        loop {
            tokio::select! {
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, peer_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let svc = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { handle_request(req, &state).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, svc)
                                    .await
                                {
                                    if !e.is_incomplete_message() {
                                        warn!(peer = %peer_addr, error = %e, "connection error");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("ingress shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: &AppState,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let Some(route) = path.strip_prefix(state.base_path.as_ref()) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "not found"));
    };

    let method = req.method().clone();
    let response = match (&method, route) {
        (&Method::GET, PING_PATH) => json_response(StatusCode::OK, &state.ingress.ping()),
        (&Method::GET, STATUS_PATH) => json_response(StatusCode::OK, &state.membership.status()),
        (&Method::POST, EVENT_PATH) => accept_event(req, state).await,
        (_, PING_PATH | STATUS_PATH | EVENT_PATH) => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn accept_event(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read event body [event dropped]");
            return text_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let event: RemoteEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "malformed event body [event dropped]");
            return text_response(StatusCode::BAD_REQUEST, "malformed event");
        }
    };

    let disposition = state.ingress.handle_inbound(event);
    debug!(?disposition, "inbound event handled");
    text_response(StatusCode::ACCEPTED, "")
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = text_response(status, body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}
