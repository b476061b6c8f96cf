//! OSC mirror for telemetry consumers that only speak OSC.
//!
//! Each telemetry envelope becomes one UDP datagram addressed
//! `/vj/{worker}/{stream}/{schema}` carrying the JSON envelope as its single
//! string argument. Sends never block: a full socket buffer or an oversized
//! datagram drops the message.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use crate::envelope::Envelope;

/// OSC address for a telemetry envelope, `None` for every other kind.
pub fn address_for(envelope: &Envelope) -> Option<String> {
    let telemetry = envelope.as_telemetry()?;
    Some(format!(
        "/vj/{}/{}/{}",
        envelope.worker(),
        telemetry.stream,
        envelope.schema()
    ))
}

/// Encode an OSC 1.0 message with a single string argument.
pub fn encode_message(address: &str, argument: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(address.len() + argument.len() + 16);
    put_osc_string(&mut buf, address);
    put_osc_string(&mut buf, ",s");
    put_osc_string(&mut buf, argument);
    buf.freeze()
}

// OSC strings are NUL terminated and padded to a multiple of four bytes.
fn put_osc_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, 4 - s.len() % 4);
}

pub struct OscMirror {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscMirror {
    pub async fn bind(target: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        tracing::debug!(%target, "OSC telemetry mirror enabled");
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Mirror `envelope` (already serialized as `json`). Returns whether a
    /// datagram was handed to the socket.
    pub fn mirror(&self, envelope: &Envelope, json: &[u8]) -> bool {
        let Some(address) = address_for(envelope) else {
            return false;
        };
        let Ok(argument) = std::str::from_utf8(json) else {
            return false;
        };
        let packet = encode_message(&address, argument);
        match self.socket.try_send_to(&packet, self.target) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(%address, error = %e, "Dropped OSC telemetry datagram");
                false
            }
        }
    }
}
