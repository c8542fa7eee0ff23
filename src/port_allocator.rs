use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const DEFAULT_MAX_ATTEMPTS: u16 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub requested_port: u16,
    pub bound_port: u16,
}

impl PortBinding {
    /// True when the configured port was taken and should be rewritten.
    pub fn changed(&self) -> bool {
        self.requested_port != self.bound_port
    }
}

/// Finds a listening port for the callback server, starting at the
/// preferred one and walking upwards.
pub struct PortAllocator {
    addr: IpAddr,
    max_attempts: u16,
}

impl PortAllocator {
    pub fn new(addr: IpAddr, max_attempts: u16) -> Self {
        Self {
            addr,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns the bound listener together with the port it ended up on.
    pub async fn allocate(&self, preferred: u16) -> Result<(TcpListener, PortBinding)> {
        let mut attempts = 0u16;
        let mut candidate = Some(preferred);

        while let Some(port) = candidate {
            if attempts >= self.max_attempts {
                break;
            }
            attempts += 1;
            match TcpListener::bind(SocketAddr::new(self.addr, port)).await {
                Ok(listener) => {
                    let bound_port = listener.local_addr()?.port();
                    let binding = PortBinding {
                        requested_port: preferred,
                        bound_port,
                    };
                    if binding.changed() {
                        info!(
                            requested = preferred,
                            bound = bound_port,
                            "preferred callback port unavailable, using fallback"
                        );
                    }
                    return Ok((listener, binding));
                }
                Err(e) => {
                    debug!(port, "port unavailable: {}", e);
                }
            }
            candidate = port.checked_add(1);
        }

        Err(Error::NoPortAvailable {
            start: preferred,
            attempts,
        })
    }
}
