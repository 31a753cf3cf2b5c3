//! Accept loop and per-connection handling for the offload proxy.
//!
//! Each connection attaches to one endpoint with a fixed coding
//! configuration, then sends requests one at a time. Requests are answered
//! in order with a reply or a fault carrying the request's id.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use reef_offload::channel::{request_queue, response_queue};
use reef_offload::message::{Frame, RequestEnvelope, read_frame, unix_millis, write_frame};
use reef_offload::{CodingConfiguration, OffloadEngine};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// TCP front end of the proxy.
pub struct ProxyServer {
    listener: TcpListener,
    /// Endpoints answered for; empty accepts any.
    endpoints: Arc<Vec<String>>,
}

impl ProxyServer {
    /// Bind the listener.
    pub async fn bind(addr: &str, endpoints: Vec<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            listener,
            endpoints: Arc::new(endpoints),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(addr = %self.local_addr()?, endpoints = ?self.endpoints, "offload proxy listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("offload proxy shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(%e, "accept failed");
                            continue;
                        }
                    };
                    let endpoints = self.endpoints.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &endpoints).await {
                            warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

/// Serve one channel connection to completion.
async fn handle_connection(mut stream: TcpStream, endpoints: &[String]) -> Result<()> {
    stream.set_nodelay(true)?;

    let (endpoint, data_units, parity_units) = match read_frame(&mut stream).await? {
        Some(Frame::Attach {
            endpoint,
            data_units,
            parity_units,
        }) => (endpoint, data_units, parity_units),
        Some(other) => {
            refuse(&mut stream, format!("expected attach, got {other:?}")).await?;
            return Ok(());
        }
        None => {
            debug!("connection closed before attach");
            return Ok(());
        }
    };

    if !endpoints.is_empty() && !endpoints.contains(&endpoint) {
        refuse(&mut stream, format!("unknown endpoint {endpoint}")).await?;
        return Ok(());
    }
    let coding = match CodingConfiguration::new(data_units.into(), parity_units.into()) {
        Ok(coding) => coding,
        Err(e) => {
            refuse(&mut stream, e.to_string()).await?;
            return Ok(());
        }
    };
    let engine = OffloadEngine::new(coding);
    write_frame(&mut stream, &Frame::Attached).await?;
    info!(
        request_queue = %request_queue(&endpoint),
        response_queue = %response_queue(&endpoint),
        k = engine.coding().data_units(),
        p = engine.coding().parity_units(),
        "endpoint attached"
    );

    while let Some(frame) = read_frame(&mut stream).await? {
        let answer = match frame {
            Frame::Request(envelope) => serve_request(&engine, envelope).await?,
            other => {
                let message = format!("unexpected frame {other:?}");
                write_frame(&mut stream, &Frame::Fault { id: 0, message }).await?;
                anyhow::bail!("protocol violation on {endpoint}");
            }
        };
        write_frame(&mut stream, &answer).await?;
    }
    debug!(%endpoint, "endpoint detached");
    Ok(())
}

/// Reply to `envelope`, or fault if it expired or cannot be computed.
async fn serve_request(engine: &OffloadEngine, envelope: RequestEnvelope) -> Result<Frame> {
    let id = envelope.id;
    if envelope.is_expired(unix_millis()) {
        warn!(id, ttl_ms = envelope.delivery.time_to_live_ms, "dropping expired request");
        return Ok(Frame::Fault {
            id,
            message: "request expired before processing".into(),
        });
    }

    let engine = engine.clone();
    let result = tokio::task::spawn_blocking(move || engine.process(&envelope.request))
        .await
        .context("coding task panicked")?;
    Ok(match result {
        Ok(reply) => {
            debug!(id, bytes = reply.payload.len(), "request served");
            Frame::Reply {
                id,
                payload: reply.payload,
            }
        }
        Err(e) => {
            error!(id, error = %e, "request failed");
            Frame::Fault {
                id,
                message: e.to_string(),
            }
        }
    })
}

async fn refuse(stream: &mut TcpStream, message: String) -> Result<()> {
    warn!(%message, "refusing attach");
    write_frame(stream, &Frame::Fault { id: 0, message }).await?;
    Ok(())
}
