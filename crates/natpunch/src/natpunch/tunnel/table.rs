use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use serde::Serialize;
use tokio::{
    net::UdpSocket,
    sync::{Mutex, RwLock, watch},
};

use crate::natpunch::{
    telemetry::{self, Side},
    tunnel::{
        flows::ServerFlows,
        frame::{Codec, Frame, Mode},
        liveness::{Liveness, Verdict},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Idle,
    NeverReady,
}

impl EvictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictReason::Idle => "idle",
            EvictReason::NeverReady => "never_ready",
        }
    }
}

/// Server-side state for one client, keyed by the `ip:port` given to the
/// rendezvous endpoint.
#[derive(Debug)]
pub struct ClientRecord {
    key: String,
    literal: SocketAddr,
    socket: Arc<UdpSocket>,
    codec: Codec,
    // Unknown until the first dummy frame; NAT may rewrite the source port.
    peer: RwLock<Option<SocketAddr>>,
    mode: RwLock<Option<Mode>>,
    liveness: Liveness,
    created_unix_ms: u64,
    should_close: AtomicBool,
    stop: watch::Sender<bool>,
    pub(crate) flows: Mutex<ServerFlows>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot {
    pub key: String,
    pub peer: Option<String>,
    pub local_port: u16,
    pub ready: bool,
    pub mode: Option<Mode>,
    pub idle_ms: u64,
    pub created_unix_ms: u64,
    pub should_close: bool,
    pub announced_flows: usize,
    pub dialed_flows: usize,
}

impl ClientRecord {
    pub fn new(key: String, literal: SocketAddr, socket: UdpSocket, codec: Codec, timeout: Duration) -> Self {
        let (stop, _rx) = watch::channel(false);
        Self {
            key,
            literal,
            socket: Arc::new(socket),
            codec,
            peer: RwLock::new(None),
            mode: RwLock::new(None),
            liveness: Liveness::new(timeout),
            created_unix_ms: telemetry::now_unix_ms(),
            should_close: AtomicBool::new(false),
            stop,
            flows: Mutex::new(ServerFlows::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub async fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().await
    }

    /// Returns the previously learned address when it changed.
    pub async fn learn_peer(&self, addr: SocketAddr) -> Option<Option<SocketAddr>> {
        if *self.peer.read().await == Some(addr) {
            return None;
        }
        let mut p = self.peer.write().await;
        if *p == Some(addr) {
            return None;
        }
        Some(p.replace(addr))
    }

    /// The learned address once known, the literal rendezvous key before.
    pub async fn best_addr(&self) -> SocketAddr {
        self.peer().await.unwrap_or(self.literal)
    }

    pub async fn mode(&self) -> Option<Mode> {
        *self.mode.read().await
    }

    /// Returns the previous mode, if any.
    pub async fn set_mode(&self, mode: Mode) -> Option<Mode> {
        self.mode.write().await.replace(mode)
    }

    pub fn should_close(&self) -> bool {
        self.should_close.load(Ordering::Acquire)
    }

    /// Marks the record for eviction and stops its tasks.
    pub fn close(&self) {
        self.should_close.store(true, Ordering::Release);
        self.stop.send_replace(true);
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub async fn send_to_client(&self, frame: &Frame) -> std::io::Result<()> {
        let b = self
            .codec
            .encode(frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let to = self.best_addr().await;
        self.socket.send_to(&b, to).await?;
        telemetry::frame_tx(Side::Server, frame.flag);
        Ok(())
    }

    pub async fn snapshot(&self) -> RecordSnapshot {
        let (announced_flows, dialed_flows) = {
            let f = self.flows.lock().await;
            (f.announced(), f.dialed())
        };
        RecordSnapshot {
            key: self.key.clone(),
            peer: self.peer().await.map(|a| a.to_string()),
            local_port: self.local_port(),
            ready: self.liveness.is_ready(),
            mode: self.mode().await,
            idle_ms: self.liveness.idle_at(Instant::now()).as_millis() as u64,
            created_unix_ms: self.created_unix_ms,
            should_close: self.should_close(),
            announced_flows,
            dialed_flows,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session {0} already exists")]
pub struct DuplicateKey(pub String);

/// Every live client record plus the rendezvous blocklist.
///
/// Tasks only reach records through this table; nothing else holds the map.
#[derive(Debug, Default)]
pub struct SessionTable {
    records: DashMap<String, Arc<ClientRecord>>,
    blocked: DashSet<IpAddr>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: Arc<ClientRecord>) -> Result<(), DuplicateKey> {
        match self.records.entry(record.key().to_string()) {
            Entry::Occupied(o) => Err(DuplicateKey(o.key().clone())),
            Entry::Vacant(v) => {
                v.insert(record);
                telemetry::active_sessions(self.records.len());
                Ok(())
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<ClientRecord>> {
        self.records.get(key).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes `record` only if it is still the entry for its key.
    pub fn remove(&self, record: &Arc<ClientRecord>) -> bool {
        let removed = self
            .records
            .remove_if(record.key(), |_, v| Arc::ptr_eq(v, record))
            .is_some();
        if removed {
            telemetry::active_sessions(self.records.len());
        }
        removed
    }

    pub fn block(&self, ip: IpAddr) -> bool {
        self.blocked.insert(ip)
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.contains(&ip)
    }

    /// Closes idle ready records and records that never became ready within
    /// `grace`. Closed records stay in the table until their receive task or
    /// [`SessionTable::sweep_closed`] removes them.
    pub fn check_liveness_at(&self, now: Instant, grace: Duration) -> Vec<(Arc<ClientRecord>, EvictReason)> {
        let mut out = Vec::new();
        for r in self.records.iter() {
            let rec = r.value();
            if rec.should_close() {
                continue;
            }
            let reason = match rec.liveness().verdict_at(now) {
                Verdict::Dead => EvictReason::Idle,
                Verdict::Pending
                    if now.saturating_duration_since(rec.liveness().created_at()) > grace =>
                {
                    EvictReason::NeverReady
                }
                _ => continue,
            };
            out.push((rec.clone(), reason));
        }
        for (rec, reason) in &out {
            rec.close();
            telemetry::session_evicted(reason.as_str());
        }
        out
    }

    /// Drops every record already marked for closing.
    pub fn sweep_closed(&self) -> Vec<Arc<ClientRecord>> {
        let mut removed = Vec::new();
        self.records.retain(|_, v| {
            if v.should_close() {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            telemetry::active_sessions(self.records.len());
        }
        removed
    }

    /// Stops every record; used on shutdown. Returns how many were still open.
    pub fn close_all(&self) -> usize {
        let mut n = 0;
        for r in self.records.iter() {
            if !r.should_close() {
                r.close();
                n += 1;
            }
        }
        n
    }

    pub async fn snapshot(&self) -> Vec<RecordSnapshot> {
        let records: Vec<Arc<ClientRecord>> = self.records.iter().map(|r| r.value().clone()).collect();
        let mut out = Vec::with_capacity(records.len());
        for r in records {
            out.push(r.snapshot().await);
        }
        out.sort_by(|a, b| a.created_unix_ms.cmp(&b.created_unix_ms));
        out
    }
}
