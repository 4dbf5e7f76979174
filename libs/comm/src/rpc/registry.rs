//! Server Registry
//!
//! Reference-counted map from server address to the shared state clients use
//! to reach it. The first client signing on to an address creates the entry:
//! a private client-facing address plus a forwarding task that moves frames
//! from that address to the server. Later clients share the entry. The
//! forwarder is torn down when the last client signs off.

use crate::config::{Direction, Role};
use crate::transport::{TransportAdapter, TransportFactory, TransportKind};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Handle a client holds while signed on to a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLease {
    key: String,
    address: String,
    client_address: String,
}

impl ServerLease {
    /// Address of the server
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Private address clients send requests to
    pub fn client_address(&self) -> &str {
        &self.client_address
    }
}

#[derive(Debug)]
struct ServerEntry {
    client_address: String,
    clients: usize,
    inbound: Arc<dyn TransportAdapter>,
    outbound: Arc<dyn TransportAdapter>,
    running: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

impl ServerEntry {
    async fn teardown(self, address: &str) {
        self.running.store(false, Ordering::Release);
        self.forwarder.abort();
        for adapter in [&self.inbound, &self.outbound] {
            if let Err(e) = adapter.close().await {
                warn!(server = %address, error = %e, "Failed to close server listener");
            }
        }
        info!(server = %address, client_address = %self.client_address, "Server listener torn down");
    }
}

/// Process-scoped registry of server listeners
#[derive(Debug, Default)]
pub struct ServerRegistry {
    entries: Mutex<HashMap<String, ServerEntry>>,
}

fn registry_key(kind: TransportKind, address: &str) -> String {
    format!("{}://{}", kind, address)
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client of the server at `address`
    ///
    /// Creates the listener on first use.
    pub async fn sign_on(
        &self,
        factory: &Arc<dyn TransportFactory>,
        address: &str,
        retry_sleep: Duration,
    ) -> Result<ServerLease> {
        let key = registry_key(factory.kind(), address);
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            entry.clients += 1;
            trace!(server = %address, clients = entry.clients, "Client signed on");
            return Ok(ServerLease {
                key,
                address: address.to_string(),
                client_address: entry.client_address.clone(),
            });
        }

        let client_address = factory.generate_address();
        let inbound = factory.create(&client_address, Direction::Recv, Role::Bind)?;
        let outbound = factory.create(address, Direction::Send, Role::Connect)?;
        inbound.open().await?;
        if let Err(e) = outbound.open().await {
            let _ = inbound.close().await;
            return Err(e);
        }

        let running = Arc::new(AtomicBool::new(true));
        let forwarder = tokio::spawn(run_forwarder(
            Arc::clone(&inbound),
            Arc::clone(&outbound),
            Arc::clone(&running),
            retry_sleep,
        ));

        info!(server = %address, client_address = %client_address, "Server listener created");
        entries.insert(
            key.clone(),
            ServerEntry {
                client_address: client_address.clone(),
                clients: 1,
                inbound,
                outbound,
                running,
                forwarder,
            },
        );

        Ok(ServerLease {
            key,
            address: address.to_string(),
            client_address,
        })
    }

    /// Release one client; the listener goes away with the last one
    pub async fn sign_off(&self, lease: &ServerLease) {
        let mut entries = self.entries.lock().await;
        let remove = match entries.get_mut(&lease.key) {
            Some(entry) if entry.client_address == lease.client_address => {
                entry.clients = entry.clients.saturating_sub(1);
                trace!(server = %lease.address, clients = entry.clients, "Client signed off");
                entry.clients == 0
            }
            _ => false,
        };
        if remove {
            if let Some(entry) = entries.remove(&lease.key) {
                entry.teardown(&lease.address).await;
            }
        }
    }

    /// Clients signed on to the server at `address`
    pub async fn client_count(&self, kind: TransportKind, address: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(&registry_key(kind, address))
            .map_or(0, |entry| entry.clients)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Tear down every listener regardless of client count
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ServerEntry)> = self.entries.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Shutting down server registry");
        }
        for (key, entry) in drained {
            entry.teardown(&key).await;
        }
    }
}

/// Move frames from the client-facing address to the server in order
async fn run_forwarder(
    inbound: Arc<dyn TransportAdapter>,
    outbound: Arc<dyn TransportAdapter>,
    running: Arc<AtomicBool>,
    retry_sleep: Duration,
) {
    let mut held = None;
    while running.load(Ordering::Acquire) {
        let frame = match held.take() {
            Some(frame) => frame,
            None => match inbound.recv_direct().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tokio::time::sleep(retry_sleep).await;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    tokio::time::sleep(retry_sleep).await;
                    continue;
                }
                Err(e) => {
                    warn!(address = %inbound.address(), error = %e, "Server forwarder stopped");
                    break;
                }
            },
        };

        match outbound.send_direct(&frame).await {
            Ok(()) => trace!(server = %outbound.address(), bytes = frame.len(), "Request forwarded"),
            Err(e) if e.is_transient() => {
                held = Some(frame);
                tokio::time::sleep(retry_sleep).await;
            }
            Err(e) => {
                warn!(server = %outbound.address(), error = %e, "Server forwarder stopped");
                break;
            }
        }
    }
}
