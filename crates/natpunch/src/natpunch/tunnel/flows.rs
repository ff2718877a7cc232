use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::{net::UdpSocket, sync::RwLock, task::AbortHandle};

/// Flow IDs are a single byte.
pub const MAX_FLOWS: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow id space exhausted ({MAX_FLOWS} flows)")]
    Exhausted,
}

/// Result of looking up a local peer on a service listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assigned {
    /// First datagram from this peer; an announcement must precede the data.
    New(u8),
    Existing(u8),
}

impl Assigned {
    pub fn id(self) -> u8 {
        match self {
            Assigned::New(id) | Assigned::Existing(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
struct ClientFlow {
    peer: SocketAddr,
    listener: Arc<UdpSocket>,
}

#[derive(Debug, Default)]
struct ClientFlowsInner {
    by_peer: HashMap<(u16, SocketAddr), u8>,
    // Index is the flow id.
    flows: Vec<ClientFlow>,
}

/// Client-side flow table: `flowID <-> (local peer, listener socket)`.
///
/// Written by every service listener task (each observing new peers) and read
/// by the tunnel receive task on the return path.
#[derive(Debug, Default)]
pub struct ClientFlows {
    inner: RwLock<ClientFlowsInner>,
}

impl ClientFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the flow id for `peer` on the listener for `service_port`,
    /// allocating `len(existing flows)` when the peer is unseen.
    pub async fn assign(
        &self,
        service_port: u16,
        peer: SocketAddr,
        listener: &Arc<UdpSocket>,
    ) -> Result<Assigned, FlowError> {
        let key = (service_port, peer);
        if let Some(id) = self.inner.read().await.by_peer.get(&key) {
            return Ok(Assigned::Existing(*id));
        }

        let mut st = self.inner.write().await;
        // Another listener may have raced us between the two locks.
        if let Some(id) = st.by_peer.get(&key) {
            return Ok(Assigned::Existing(*id));
        }
        if st.flows.len() >= MAX_FLOWS {
            return Err(FlowError::Exhausted);
        }
        let id = st.flows.len() as u8;
        st.flows.push(ClientFlow {
            peer,
            listener: listener.clone(),
        });
        st.by_peer.insert(key, id);
        Ok(Assigned::New(id))
    }

    /// Where to deliver a payload arriving from the tunnel for `flow`.
    pub async fn route(&self, flow: u8) -> Option<(SocketAddr, Arc<UdpSocket>)> {
        let st = self.inner.read().await;
        st.flows
            .get(flow as usize)
            .map(|f| (f.peer, f.listener.clone()))
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.flows.len()
    }

    /// Drops every flow binding. Listener sockets themselves are owned elsewhere
    /// and stay bound.
    pub async fn clear(&self) {
        let mut st = self.inner.write().await;
        st.by_peer.clear();
        st.flows.clear();
    }
}

/// A dialed socket to a local service plus the task pumping its replies back
/// into the tunnel.
#[derive(Debug)]
pub struct ServiceConn {
    pub sock: Arc<UdpSocket>,
    pub reader: AbortHandle,
}

/// Server-side flow state for one client record.
#[derive(Debug, Default)]
pub struct ServerFlows {
    ports: HashMap<u8, u16>,
    conns: HashMap<u8, ServiceConn>,
}

impl ServerFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self, flow: u8) -> Option<u16> {
        self.ports.get(&flow).copied()
    }

    /// Records the destination port for `flow`. Returns the previously bound
    /// port when the flow was already announced (the binding is left as is).
    pub fn announce(&mut self, flow: u8, port: u16) -> Result<(), u16> {
        match self.ports.get(&flow) {
            Some(prev) => Err(*prev),
            None => {
                self.ports.insert(flow, port);
                Ok(())
            }
        }
    }

    /// Live socket for `flow`. A connection whose reader already exited is
    /// discarded so that the next data frame re-dials.
    pub fn conn(&mut self, flow: u8) -> Option<Arc<UdpSocket>> {
        let finished = self.conns.get(&flow)?.reader.is_finished();
        if finished {
            self.conns.remove(&flow);
            return None;
        }
        self.conns.get(&flow).map(|c| c.sock.clone())
    }

    pub fn insert_conn(&mut self, flow: u8, conn: ServiceConn) {
        if let Some(old) = self.conns.insert(flow, conn) {
            old.reader.abort();
        }
    }

    pub fn drop_conn(&mut self, flow: u8) {
        if let Some(old) = self.conns.remove(&flow) {
            old.reader.abort();
        }
    }

    pub fn announced(&self) -> usize {
        self.ports.len()
    }

    pub fn dialed(&self) -> usize {
        self.conns.len()
    }

    pub fn close_all(&mut self) {
        for (_flow, c) in self.conns.drain() {
            c.reader.abort();
        }
    }
}

impl Drop for ServerFlows {
    fn drop(&mut self) {
        self.close_all();
    }
}
