//! Local port allocation for instances.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{ControllerError, Result};

/// Hands out ports the OS reports as free.
///
/// The probe socket is released before the port is returned, so another
/// process can still grab it first. An instance that then fails to bind
/// fails its run command like any other start failure.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    host: Ipv4Addr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
        }
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> Result<u16> {
        let listener = TcpListener::bind(SocketAddr::from((self.host, 0)))
            .await
            .map_err(ControllerError::PortExhausted)?;
        let port = listener
            .local_addr()
            .map_err(ControllerError::PortExhausted)?
            .port();
        drop(listener);

        debug!(port, "Acquired port");
        Ok(port)
    }
}
