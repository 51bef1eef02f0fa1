//! Wire framing and TCP listener
//!
//! Frames are `magic (4) | length (4, big endian) | payload`, where the
//! payload is a serialized [`Message`]. The magic bytes identify the network
//! so that nodes on different networks never talk to each other.

use crate::network::message::{Message, MAX_MESSAGE_SIZE};
use crate::network::node::Node;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

const HEADER_SIZE: usize = 8;

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Message codec for length-prefixed framing
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    magic: [u8; 4],
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.to_bytes().map_err(|e| invalid_data(e.to_string()))?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_data(format!(
                "{} message of {} bytes exceeds the maximum",
                item.command(),
                data.len()
            )));
        }

        dst.reserve(HEADER_SIZE + data.len());
        dst.put_slice(&self.magic);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[..4] != self.magic {
            return Err(invalid_data("Invalid magic bytes"));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(invalid_data(format!("Message length {} too large", len)));
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let data = src.split_to(len);

        let msg = Message::from_bytes(&data).map_err(|e| invalid_data(e.to_string()))?;
        Ok(Some(msg))
    }
}

/// TCP listener handing accepted sockets to a [`Node`]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    pub async fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `quit` fires
    pub async fn run(self, node: Node, quit: CancellationToken) {
        loop {
            tokio::select! {
                _ = quit.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        log::debug!("Accepted connection from {}", remote);
                        node.inbound_peer_connected(stream, remote);
                    }
                    Err(e) => log::warn!("Can't accept connection: {}", e),
                },
            }
        }
        log::info!("Server on {} stopped listening", self.local_addr);
    }
}
