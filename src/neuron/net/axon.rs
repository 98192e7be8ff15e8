use std::net::SocketAddr;

use quinn::{Connecting, RecvStream, SendStream};
use rkyv::{
    de::deserializers::SharedDeserializeMap,
    ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator,
    Archive, CheckBytes, Deserialize, Serialize,
};
use tracing::{debug, debug_span, Instrument};

use super::{
    error::Error,
    wire::{
        decode_frame, encode_frame, MessageId, Request, Response, Tensor,
        MAX_FRAME_BYTES,
    },
};

/// Axons are the QUIC links a node keeps open to its downstream peers.
///
/// Can be cloned to obtain another handle to the same axon. Every RPC is
/// one bidirectional stream: a single request frame out, a single response
/// frame back.
#[derive(Clone)]
pub struct Axon {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
}

impl Axon {
    /// Completes an in-progress connection.
    pub async fn new(in_progress: Connecting) -> Result<Self, Error> {
        let remote_addr = in_progress.remote_address();
        let span = debug_span!("axon", remote = %remote_addr);
        async move {
            debug!("establishing QUIC connection");
            let conn = in_progress.await?;
            debug!("connected via QUIC");
            Ok(Axon { conn, remote_addr })
        }
        .instrument(span)
        .await
    }

    pub fn id(&self) -> usize {
        self.conn.stable_id()
    }

    pub fn conn(&self) -> &quinn::Connection {
        &self.conn
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Forward RPC. Returns the responder's identity and its output.
    pub async fn spike(
        &self,
        sender: String,
        message_id: MessageId,
        payload: Tensor,
    ) -> Result<(String, Tensor), Error> {
        let response = self
            .call(Request::Spike {
                sender,
                message_id,
                payload,
            })
            .await?;
        match response {
            Response::Spike {
                responder,
                message_id: answered_id,
                payload,
            } => {
                if answered_id != message_id {
                    return Err(Error::UnexpectedResponse);
                }
                Ok((responder, payload))
            }
            Response::Error { reason } => Err(Error::Remote(reason)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Backward RPC. Returns whether the peer accepted the gradient.
    pub async fn grade(
        &self,
        sender: String,
        message_id: MessageId,
        grad: Tensor,
    ) -> Result<bool, Error> {
        let response = self
            .call(Request::Grade {
                sender,
                message_id,
                grad,
            })
            .await?;
        match response {
            Response::Grade { accepted } => Ok(accepted),
            Response::Error { reason } => Err(Error::Remote(reason)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    async fn call(&self, request: Request) -> Result<Response, Error> {
        let span = debug_span!("rpc", remote = %self.remote_addr);
        async move {
            let (tx, rx) = self.conn.open_bi().await?;
            let mut send = RpcSendStream::new(tx);
            let mut recv = RpcRecvStream::new(rx);
            send.send(&request).await?;
            recv.receive().await
        }
        .instrument(span)
        .await
    }
}

pub struct RpcSendStream(SendStream);

impl RpcSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    /// Writes one length-prefixed frame and finishes the stream.
    pub async fn send<T>(&mut self, msg: &T) -> Result<(), Error>
    where
        T: Serialize<AllocSerializer<1024>>,
    {
        let frame = encode_frame(msg).await?;
        let len = frame.len();
        let mut buf = Vec::with_capacity(4 + len);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.extend_from_slice(&frame);
        self.0.write_all(&buf).await?;
        self.0.finish().await?;
        Ok(())
    }
}

pub struct RpcRecvStream(RecvStream);

impl RpcRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    /// Reads one length-prefixed frame.
    pub async fn receive<T>(&mut self) -> Result<T, Error>
    where
        T: Archive,
        for<'a> <T as Archive>::Archived: CheckBytes<DefaultValidator<'a>>
            + Deserialize<T, SharedDeserializeMap>,
    {
        let mut len_buf = [0u8; 4];
        self.0.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(Error::MessageLengthOverflowed);
        }
        let mut frame = vec![0u8; len as usize];
        self.0.read_exact(&mut frame).await?;
        decode_frame(&frame).await
    }
}
