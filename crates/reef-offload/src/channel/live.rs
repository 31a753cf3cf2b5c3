//! TCP session to the offload proxy.
//!
//! One connection per channel. The connection is bound to a single compute
//! endpoint by an attach handshake; after that each request frame is
//! answered by exactly one reply or fault frame carrying the same id.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{EndpointSelector, OffloadChannel, request_queue, response_queue};
use crate::config::{CodingConfiguration, DeliveryOptions, OffloadConfig};
use crate::error::ChannelError;
use crate::message::{
    Frame, OffloadReply, OffloadRequest, RequestEnvelope, read_frame, unix_millis, write_frame,
};

/// How the proxy answered one request.
enum Outcome {
    Reply(OffloadReply),
    Fault(String),
}

/// [`OffloadChannel`] talking to a proxy over TCP.
///
/// A timeout or transport failure drops the connection; the next `send`
/// re-attaches. Faults reported by the proxy keep it. If the caller drops a
/// `send` or `receive` future before the answer is read, the stream may
/// hold a late answer or a partial frame; the next `send` replaces it.
#[derive(Debug)]
pub struct LiveChannel {
    provider_addr: String,
    endpoint: String,
    coding: CodingConfiguration,
    delivery: DeliveryOptions,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    next_id: u64,
    /// Request whose exchange started and has not finished.
    in_flight: Option<u64>,
}

impl LiveChannel {
    /// Pick an endpoint and attach to it through the configured proxy.
    ///
    /// # Errors
    ///
    /// [`ChannelError::NotConnected`] if no endpoint is configured or the
    /// proxy cannot be reached or refuses the attach within the connect
    /// timeout.
    pub async fn connect(
        config: &OffloadConfig,
        coding: CodingConfiguration,
        selector: &mut EndpointSelector,
    ) -> Result<Self, ChannelError> {
        let endpoint = selector
            .choose(&config.endpoints)
            .ok_or_else(|| ChannelError::NotConnected("no offload endpoints configured".into()))?
            .to_string();

        let mut channel = Self {
            provider_addr: config.provider_addr.clone(),
            endpoint,
            coding,
            delivery: config.delivery,
            connect_timeout: config.connect_timeout,
            stream: None,
            next_id: 1,
            in_flight: None,
        };
        channel.attach().await?;
        info!(
            provider = %channel.provider_addr,
            request_queue = %request_queue(&channel.endpoint),
            response_queue = %response_queue(&channel.endpoint),
            "offload channel attached"
        );
        Ok(channel)
    }

    /// Whether a connection is currently held.
    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    async fn attach(&mut self) -> Result<(), ChannelError> {
        let addr = self.provider_addr.clone();
        let hello = Frame::Attach {
            endpoint: self.endpoint.clone(),
            data_units: self.coding.data_units() as u8,
            parity_units: self.coding.parity_units() as u8,
        };

        let handshake = async move {
            let mut stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| ChannelError::NotConnected(format!("connect to {addr}: {e}")))?;
            stream.set_nodelay(true)?;
            write_frame(&mut stream, &hello).await?;
            match read_frame(&mut stream).await? {
                Some(Frame::Attached) => Ok::<_, ChannelError>(stream),
                Some(Frame::Fault { message, .. }) => Err(ChannelError::NotConnected(format!(
                    "proxy refused attach: {message}"
                ))),
                Some(other) => Err(ChannelError::TransportFailure(format!(
                    "unexpected frame during attach: {other:?}"
                ))),
                None => Err(ChannelError::NotConnected(
                    "proxy closed the connection during attach".into(),
                )),
            }
        };

        let stream = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ChannelError::NotConnected(format!(
                    "attach to {} not completed within {:?}",
                    self.endpoint, self.connect_timeout
                ))
            })??;
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self, reason: &ChannelError) {
        if self.stream.take().is_some() {
            warn!(endpoint = %self.endpoint, error = %reason, "dropping offload connection");
        }
    }

    async fn await_outcome(stream: &mut TcpStream, id: u64) -> Result<Outcome, ChannelError> {
        match read_frame(stream).await? {
            Some(Frame::Reply { id: got, payload }) if got == id => {
                Ok(Outcome::Reply(OffloadReply { payload }))
            }
            Some(Frame::Fault { id: got, message }) if got == id => Ok(Outcome::Fault(message)),
            Some(Frame::Reply { id: got, .. } | Frame::Fault { id: got, .. }) => Err(
                ChannelError::TransportFailure(format!("answer for request {got} while waiting for {id}")),
            ),
            Some(other) => Err(ChannelError::TransportFailure(format!(
                "unexpected frame: {other:?}"
            ))),
            None => Err(ChannelError::TransportFailure(
                "proxy closed the connection".into(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl OffloadChannel for LiveChannel {
    async fn send(&mut self, request: OffloadRequest) -> Result<(), ChannelError> {
        if let Some(stale) = self.in_flight.take() {
            self.disconnect(&ChannelError::TransportFailure(format!(
                "exchange for request {stale} was abandoned"
            )));
        }
        if self.stream.is_none() {
            self.attach().await?;
            info!(endpoint = %self.endpoint, "offload channel re-attached");
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let frame = Frame::Request(RequestEnvelope {
            id,
            delivery: self.delivery,
            sent_at_ms: unix_millis(),
            request,
        });

        let Some(stream) = self.stream.as_mut() else {
            return Err(ChannelError::NotConnected(self.endpoint.clone()));
        };
        self.in_flight = Some(id);
        if let Err(e) = write_frame(stream, &frame).await {
            self.in_flight = None;
            self.disconnect(&e);
            return Err(e);
        }
        debug!(id, endpoint = %self.endpoint, "request sent");
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<OffloadReply, ChannelError> {
        let id = self.in_flight.ok_or_else(|| {
            ChannelError::TransportFailure("receive without an outstanding request".into())
        })?;
        let Some(stream) = self.stream.as_mut() else {
            self.in_flight = None;
            return Err(ChannelError::NotConnected(self.endpoint.clone()));
        };

        let outcome = match tokio::time::timeout(timeout, Self::await_outcome(stream, id)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(timeout)),
        };
        self.in_flight = None;
        match outcome {
            Ok(Outcome::Reply(reply)) => {
                debug!(id, bytes = reply.payload.len(), "reply received");
                Ok(reply)
            }
            Ok(Outcome::Fault(message)) => {
                warn!(id, endpoint = %self.endpoint, %message, "proxy reported a fault");
                Err(ChannelError::TransportFailure(format!("proxy fault: {message}")))
            }
            Err(e) => {
                self.disconnect(&e);
                Err(e)
            }
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
