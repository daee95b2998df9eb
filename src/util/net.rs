use std::net::SocketAddr;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::net::{lookup_host, UdpSocket};

use crate::message::{Message, MAX_MESSAGE_SIZE};

/// Sends `count` copies of `msg` to `dst`. There is no retransmission anywhere in
///  the protocol; sending a handful of copies up front is the whole loss-mitigation
///  strategy.
pub async fn blast(socket: &UdpSocket, dst: SocketAddr, count: usize, msg: &Message) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(MAX_MESSAGE_SIZE);
    msg.ser(&mut buf);

    for _ in 0..count {
        socket.send_to(&buf, dst).await?;
    }
    Ok(())
}

/// Resolves `addr` to the first UDP socket address it maps to. Callers re-resolve on
///  every use so that a hostname moving between hosts is eventually picked up.
pub async fn resolve_udp_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| anyhow!("address {:?} did not resolve to any socket address", addr))
}
