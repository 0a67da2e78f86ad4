//! In-process transport provider.
//!
//! All nodes sharing one [`MemoryHub`] can reach each other without any
//! real networking: dialing a registered contact point completes the
//! handshake synchronously and hands both endpoints a channel-backed link.
//! The hub doubles as the fault injection point for tests (unreachable
//! endpoints, unresponsive probes).

use super::{
    link_pair, EstablishedLink, InboundHandler, PeerHello, Transport, TransportError,
};
use crate::contact::ContactPoint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default transport token served by the memory provider.
pub const MEMORY_TRANSPORT_KIND: &str = "mem";

struct Registration {
    hello: PeerHello,
    handler: Arc<dyn InboundHandler>,
    probe_ok: Arc<AtomicBool>,
}

#[derive(Default)]
struct HubInner {
    listeners: HashMap<ContactPoint, Registration>,
}

/// Shared registry connecting all memory transports of one test network.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make probes toward `contact` hang (true) or answer again (false).
    ///
    /// Affects established links as well as future ones.
    pub fn set_probe_failing(&self, contact: &ContactPoint, failing: bool) {
        if let Some(reg) = self.lock().listeners.get(contact) {
            reg.probe_ok.store(!failing, Ordering::Relaxed);
        }
    }

    /// Drop the listener for `contact`, refusing future dials.
    pub fn drop_listener(&self, contact: &ContactPoint) {
        self.lock().listeners.remove(contact);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's attachment to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    kind: String,
    hello: PeerHello,
    /// Source address presented to remote admission filters.
    local_ip: String,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub, hello: PeerHello, local_ip: impl Into<String>) -> Self {
        Self {
            hub,
            kind: MEMORY_TRANSPORT_KIND.to_string(),
            hello,
            local_ip: local_ip.into(),
        }
    }

    /// Serve a different transport token (e.g. stand in for `tcp`).
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn dial(&self, contact: &ContactPoint) -> Result<EstablishedLink, TransportError> {
        // look up the listener and clone what the handshake needs, so the
        // registry lock is never held across an await
        let (remote_hello, handler, probe_ok) = {
            let inner = self.hub.lock();
            let reg = inner
                .listeners
                .get(contact)
                .ok_or_else(|| TransportError::ConnectionRefused(contact.to_string()))?;
            (reg.hello.clone(), Arc::clone(&reg.handler), Arc::clone(&reg.probe_ok))
        };

        if !handler.admit(&self.local_ip) {
            return Err(TransportError::AdmissionDenied(contact.to_string()));
        }

        let (dialer_link, dialer_rx, acceptor_link, acceptor_rx) = link_pair(probe_ok);

        handler
            .accept(
                EstablishedLink {
                    remote: self.hello.clone(),
                    link: acceptor_link,
                    incoming: acceptor_rx,
                },
                self.local_ip.clone(),
            )
            .await;

        debug!(contact = %contact, "Memory transport handshake complete");
        Ok(EstablishedLink {
            remote: remote_hello,
            link: dialer_link,
            incoming: dialer_rx,
        })
    }

    async fn listen(
        &self,
        contact: &ContactPoint,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError> {
        let mut inner = self.hub.lock();
        if inner.listeners.contains_key(contact) {
            return Err(TransportError::AlreadyListening(contact.to_string()));
        }
        inner.listeners.insert(
            contact.clone(),
            Registration {
                hello: self.hello.clone(),
                handler,
                probe_ok: Arc::new(AtomicBool::new(true)),
            },
        );
        Ok(())
    }

    async fn close_listener(&self, contact: &ContactPoint) -> Result<(), TransportError> {
        self.hub
            .lock()
            .listeners
            .remove(contact)
            .map(|_| ())
            .ok_or_else(|| TransportError::NotListening(contact.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{NodeId, SessionId};
    use crate::transport::Frame;
    use tokio::sync::mpsc;

    fn hello(name: &str) -> PeerHello {
        PeerHello {
            session: SessionId::fresh(NodeId::random()),
            relay: true,
            display_name: name.to_string(),
            contact: None,
        }
    }

    struct RecordingHandler {
        allow: bool,
        accepted: mpsc::Sender<(PeerHello, String)>,
    }

    #[async_trait]
    impl InboundHandler for RecordingHandler {
        fn admit(&self, _remote_ip: &str) -> bool {
            self.allow
        }

        async fn accept(&self, link: EstablishedLink, remote_ip: String) {
            let _ = self.accepted.send((link.remote, remote_ip)).await;
        }
    }

    fn contact(port: u16) -> ContactPoint {
        ContactPoint::new(MEMORY_TRANSPORT_KIND, "node", port)
    }

    #[tokio::test]
    async fn dial_reaches_registered_listener() {
        let hub = MemoryHub::new();
        let (tx, mut rx) = mpsc::channel(1);

        let server = MemoryTransport::new(hub.clone(), hello("server"), "10.0.0.2");
        server
            .listen(&contact(1), Arc::new(RecordingHandler { allow: true, accepted: tx }))
            .await
            .unwrap();

        let client = MemoryTransport::new(hub, hello("client"), "10.0.0.1");
        let established = client.dial(&contact(1)).await.unwrap();
        assert_eq!(established.remote.display_name, "server");

        let (remote, ip) = rx.recv().await.unwrap();
        assert_eq!(remote.display_name, "client");
        assert_eq!(ip, "10.0.0.1");

        // frames flow end to end
        established.link.send(Frame::LsaBatch(Vec::new())).await.unwrap();
    }

    #[tokio::test]
    async fn dial_unregistered_contact_is_refused() {
        let hub = MemoryHub::new();
        let client = MemoryTransport::new(hub, hello("client"), "10.0.0.1");
        assert!(matches!(
            client.dial(&contact(9)).await,
            Err(TransportError::ConnectionRefused(_))
        ));
    }

    #[tokio::test]
    async fn admission_denial_blocks_handshake() {
        let hub = MemoryHub::new();
        let (tx, mut rx) = mpsc::channel(1);

        let server = MemoryTransport::new(hub.clone(), hello("server"), "10.0.0.2");
        server
            .listen(&contact(1), Arc::new(RecordingHandler { allow: false, accepted: tx }))
            .await
            .unwrap();

        let client = MemoryTransport::new(hub, hello("client"), "10.0.0.1");
        assert!(matches!(
            client.dial(&contact(1)).await,
            Err(TransportError::AdmissionDenied(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_listen_is_rejected() {
        let hub = MemoryHub::new();
        let (tx, _rx) = mpsc::channel(1);
        let handler = Arc::new(RecordingHandler { allow: true, accepted: tx });

        let server = MemoryTransport::new(hub, hello("server"), "10.0.0.2");
        server.listen(&contact(1), handler.clone()).await.unwrap();
        assert!(matches!(
            server.listen(&contact(1), handler).await,
            Err(TransportError::AlreadyListening(_))
        ));

        server.close_listener(&contact(1)).await.unwrap();
        assert!(matches!(
            server.close_listener(&contact(1)).await,
            Err(TransportError::NotListening(_))
        ));
    }
}
