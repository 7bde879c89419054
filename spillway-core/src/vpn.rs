//! Tunnel lifecycle seam.
//!
//! Some deployments reach their sources through a VPN whose lifecycle is
//! managed elsewhere. The core only needs this contract; tunnel-less
//! deployments get the no-op implementation.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
#[error("Tunnel control failed: {reason}")]
pub struct TunnelError {
    pub reason: String,
}

/// External tunnel control contract.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn connect(&self) -> Result<(), TunnelError>;

    async fn disconnect(&self) -> Result<(), TunnelError>;

    async fn is_connected(&self) -> bool;
}

/// Tunnel-less deployment: always connected, nothing to do.
pub struct NoTunnel;

#[async_trait]
impl TunnelControl for NoTunnel {
    async fn connect(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }
}
