//! Seam for NAT gateway port forwarding.
//!
//! A peer that hears nothing back during its initial handshake can fall back to
//!  opening a port on a UPnP/NAT-PMP-style gateway. Discovery and mapping are left
//!  to implementations of the traits below; the peer only drives discovery, the
//!  periodic refresh and the removal on close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// A NAT gateway on which port mappings can be installed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NatGateway: Send + Sync {
    /// Maps `port` on the gateway to the same port on this host for `lease`.
    ///  Re-adding an existing mapping renews its lease.
    async fn add_port_mapping(&self, protocol: &str, port: u16, lease: Duration) -> anyhow::Result<()>;

    async fn delete_port_mapping(&self, protocol: &str, port: u16) -> anyhow::Result<()>;
}

/// Locates the gateway responsible for this host's network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Arc<dyn NatGateway>>;
}
