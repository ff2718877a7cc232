use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use tokio::{net::UdpSocket, sync::watch, task::JoinSet};

use crate::natpunch::{
    net,
    telemetry::{self, Side},
    tunnel::{
        flows::ServiceConn,
        frame::{Codec, Flag, Frame},
        http,
        table::{ClientRecord, DuplicateKey, SessionTable},
    },
};

const RECV_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Rendezvous HTTP endpoint (`":80"` shorthand accepted).
    pub listen_addr: String,
    /// Address per-client tunnel sockets bind on.
    pub bind_ip: IpAddr,
    /// Host that announced destination ports are dialed on.
    pub forward_host: IpAddr,
    pub codec: Codec,
    pub timeout: Duration,
    pub sweep_interval: Duration,
    pub ready_grace: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("malformed client address {0:?}")]
    Malformed(String),
    #[error(transparent)]
    Duplicate(#[from] DuplicateKey),
    #[error("allocate udp socket: {0}")]
    Allocate(io::Error),
    #[error("unknown session {0:?}")]
    UnknownSession(String),
    #[error("caller is blocklisted")]
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordEnd {
    ClosedByClient,
    Stopped,
}

pub struct Server {
    opts: ServerOptions,
    table: Arc<SessionTable>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            opts,
            table: Arc::new(SessionTable::new()),
        }
    }

    pub fn table(&self) -> Arc<SessionTable> {
        self.table.clone()
    }

    /// Handles a rendezvous GET: allocates a per-client socket and returns its
    /// port. A malformed key blocklists `caller`.
    pub async fn register(&self, caller: IpAddr, key: &str) -> Result<u16, RegisterError> {
        if self.table.is_blocked(caller) {
            return Err(RegisterError::Blocked);
        }
        let Some(literal) = net::parse_ipv4_endpoint(key) else {
            if self.table.block(caller) {
                tracing::warn!(caller = %caller, key = %key, "server: malformed rendezvous key; caller blocklisted");
            }
            return Err(RegisterError::Malformed(key.to_string()));
        };
        if self.table.contains(key) {
            return Err(DuplicateKey(key.to_string()).into());
        }

        let sock = UdpSocket::bind(SocketAddr::new(self.opts.bind_ip, 0))
            .await
            .map_err(RegisterError::Allocate)?;
        let record = Arc::new(ClientRecord::new(
            key.to_string(),
            SocketAddr::V4(literal),
            sock,
            self.opts.codec,
            self.opts.timeout,
        ));
        let port = record.local_port();
        self.table.insert(record.clone())?;
        telemetry::session_registered();

        tracing::info!(key = %key, port, "server: client registered");
        tokio::spawn(serve_record(record, self.table.clone(), self.opts.forward_host));
        Ok(port)
    }

    /// Handles a rendezvous POST: schedules a dummy frame toward the client.
    pub fn request_dummy(&self, caller: IpAddr, key: &str) -> Result<(), RegisterError> {
        if self.table.is_blocked(caller) {
            return Err(RegisterError::Blocked);
        }
        let record = self
            .table
            .get(key)
            .ok_or_else(|| RegisterError::UnknownSession(key.to_string()))?;
        tokio::spawn(async move {
            let to = record.best_addr().await;
            match record.send_to_client(&Frame::dummy()).await {
                Ok(()) => tracing::info!(key = %record.key(), to = %to, "server: dummy frame sent"),
                Err(err) => tracing::warn!(key = %record.key(), to = %to, err = %err, "server: dummy frame send failed"),
            }
        });
        Ok(())
    }

    pub async fn listen_and_serve(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let listener = tokio::net::TcpListener::bind(addr.as_ref())
            .await
            .with_context(|| format!("bind rendezvous endpoint {}", self.opts.listen_addr))?;
        tracing::info!(
            addr = %self.opts.listen_addr,
            timeout = %humantime::format_duration(self.opts.timeout),
            "server: rendezvous endpoint listening"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(liveness_loop(
            self.table.clone(),
            self.opts.timeout,
            self.opts.ready_grace,
            shutdown.clone(),
        ));
        tasks.spawn(sweep_loop(self.table.clone(), self.opts.sweep_interval, shutdown.clone()));

        let res = http::serve(listener, self.clone(), shutdown).await;

        self.close_all().await;
        tasks.shutdown().await;
        res
    }

    /// Stops every record and gives their tasks a moment to send close frames.
    pub async fn close_all(&self) {
        let n = self.table.close_all();
        if n > 0 {
            tracing::info!(sessions = n, "server: closing sessions");
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while !self.table.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Owns one record for its whole lifetime: runs the receive loop, then tears
/// down every flow and leaves the table.
async fn serve_record(record: Arc<ClientRecord>, table: Arc<SessionTable>, forward_host: IpAddr) {
    let res = record_loop(&record, forward_host).await;
    let peer = record.best_addr().await;

    record.close();
    let end = match res {
        Ok(end) => end,
        Err(err) => {
            tracing::warn!(key = %record.key(), peer = %peer, err = %err, "server: tunnel socket failed");
            RecordEnd::Stopped
        }
    };
    if end != RecordEnd::ClosedByClient {
        if let Err(err) = record.send_to_client(&Frame::close()).await {
            tracing::debug!(key = %record.key(), err = %err, "server: close frame not sent");
        }
    }
    record.flows.lock().await.close_all();

    table.remove(&record);
    tracing::info!(key = %record.key(), peer = %peer, reason = ?end, "server: session closed");
}

async fn record_loop(record: &Arc<ClientRecord>, forward_host: IpAddr) -> io::Result<RecordEnd> {
    let mut stop = record.stop_signal();
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        if *stop.borrow() {
            return Ok(RecordEnd::Stopped);
        }
        let (n, src) = tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    return Ok(RecordEnd::Stopped);
                }
                continue;
            }
            res = record.socket().recv_from(&mut buf) => res?,
        };

        let frame = match record.codec().decode(&buf[..n]) {
            Ok(f) => f,
            Err(err) => {
                tracing::debug!(key = %record.key(), src = %src, err = %err, "server: malformed frame dropped");
                telemetry::frame_dropped(Side::Server, "malformed");
                continue;
            }
        };
        if let Some(end) = handle_frame(record, frame, src, forward_host).await? {
            return Ok(end);
        }
    }
}

async fn handle_frame(
    record: &Arc<ClientRecord>,
    frame: Frame,
    src: SocketAddr,
    forward_host: IpAddr,
) -> io::Result<Option<RecordEnd>> {
    telemetry::frame_rx(Side::Server, frame.flag);

    // Replies follow the latest source; the client's NAT may rebind mid-session.
    if let Some(prev) = record.learn_peer(src).await {
        match prev {
            Some(prev) => {
                tracing::info!(key = %record.key(), from = %prev, to = %src, "server: client address changed")
            }
            None if src.to_string() != record.key() => {
                tracing::info!(key = %record.key(), actual = %src, "server: client address rewritten by NAT")
            }
            None => {}
        }
    }
    // Any frame proves the path, so a lost handshake dummy does not strand the record.
    if record.liveness().mark_ready() {
        tracing::info!(key = %record.key(), peer = %src, flag = frame.flag.as_str(), "server: client ready");
    }

    match frame.flag {
        Flag::Dummy => {}
        Flag::KeepAlive => {
            let ack = record
                .codec()
                .encode(&Frame::keep_alive_ack())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            record.socket().send_to(&ack, src).await?;
            telemetry::frame_tx(Side::Server, Flag::KeepAliveAck);
        }
        Flag::KeepAliveAck => {}
        Flag::Close => {
            tracing::info!(key = %record.key(), "server: close frame received");
            return Ok(Some(RecordEnd::ClosedByClient));
        }
        Flag::Mode => match frame.announced_mode() {
            Some(mode) => {
                let prev = record.set_mode(mode).await;
                if prev.is_some_and(|p| p != mode) {
                    tracing::warn!(key = %record.key(), mode = mode.as_str(), "server: client changed mode");
                } else if prev.is_none() {
                    tracing::info!(key = %record.key(), mode = mode.as_str(), "server: mode announced");
                }
            }
            None => {
                tracing::warn!(key = %record.key(), payload = ?&frame.payload[..], "server: unknown mode dropped");
                telemetry::frame_dropped(Side::Server, "bad_mode");
            }
        },
        Flag::Announce => announce_flow(record, &frame).await,
        Flag::Data => forward_to_service(record, frame, forward_host).await,
    }
    Ok(None)
}

async fn announce_flow(record: &Arc<ClientRecord>, frame: &Frame) {
    if record.mode().await.is_none() {
        tracing::warn!(key = %record.key(), flow = frame.flow, "server: port announcement before mode announcement ignored");
        telemetry::frame_dropped(Side::Server, "announce_before_mode");
        return;
    }
    let port = match frame.announced_port() {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(key = %record.key(), flow = frame.flow, err = %err, "server: bad announcement dropped");
            telemetry::frame_dropped(Side::Server, "bad_announce");
            return;
        }
    };
    match record.flows.lock().await.announce(frame.flow, port) {
        Ok(()) => {
            tracing::info!(key = %record.key(), flow = frame.flow, port, "server: flow announced");
        }
        Err(prev) if prev != port => {
            tracing::warn!(key = %record.key(), flow = frame.flow, port, bound = prev, "server: flow re-announced with another port; ignored");
        }
        Err(_) => {}
    }
}

async fn forward_to_service(record: &Arc<ClientRecord>, frame: Frame, forward_host: IpAddr) {
    let flow = frame.flow;
    let sock = {
        let mut flows = record.flows.lock().await;
        let Some(port) = flows.port(flow) else {
            tracing::debug!(key = %record.key(), flow, "server: data for unannounced flow dropped");
            telemetry::frame_dropped(Side::Server, "unknown_flow");
            return;
        };
        match flows.conn(flow) {
            Some(s) => s,
            None => match dial_service(record, flow, SocketAddr::new(forward_host, port)).await {
                Ok(conn) => {
                    let s = conn.sock.clone();
                    flows.insert_conn(flow, conn);
                    s
                }
                Err(err) => {
                    tracing::warn!(key = %record.key(), flow, port, err = %err, "server: dial local service failed");
                    telemetry::frame_dropped(Side::Server, "dial_failed");
                    return;
                }
            },
        }
    };

    if let Err(err) = sock.send(&frame.payload).await {
        tracing::warn!(key = %record.key(), flow, err = %err, "server: local service write failed; flow reset");
        record.flows.lock().await.drop_conn(flow);
    }
}

async fn dial_service(record: &Arc<ClientRecord>, flow: u8, target: SocketAddr) -> io::Result<ServiceConn> {
    let bind = match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let sock = UdpSocket::bind(bind).await?;
    sock.connect(target).await?;
    let sock = Arc::new(sock);

    let reader = tokio::spawn(pump_service(record.clone(), flow, sock.clone()));
    tracing::info!(key = %record.key(), flow, target = %target, "server: dialed local service");
    Ok(ServiceConn {
        sock,
        reader: reader.abort_handle(),
    })
}

/// Local service -> tunnel for one flow.
async fn pump_service(record: Arc<ClientRecord>, flow: u8, sock: Arc<UdpSocket>) {
    let mut stop = record.stop_signal();
    let max = record.codec().max_payload();
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        if *stop.borrow() {
            return;
        }
        let n = tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    return;
                }
                continue;
            }
            res = sock.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(err) => {
                    // Typically ICMP port unreachable surfacing on a connected socket.
                    tracing::debug!(key = %record.key(), flow, err = %err, "server: local service read failed; flow closed");
                    return;
                }
            },
        };
        if n > max {
            tracing::warn!(key = %record.key(), flow, len = n, max, "server: oversized datagram from local service dropped");
            telemetry::frame_dropped(Side::Server, "oversized");
            continue;
        }
        let frame = Frame::data(flow, Bytes::copy_from_slice(&buf[..n]));
        if let Err(err) = record.send_to_client(&frame).await {
            tracing::warn!(key = %record.key(), flow, err = %err, "server: tunnel write failed");
            record.close();
            return;
        }
    }
}

async fn liveness_loop(
    table: Arc<SessionTable>,
    timeout: Duration,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = timeout.min(grace).max(Duration::from_millis(100));
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                for (rec, reason) in table.check_liveness_at(Instant::now(), grace) {
                    tracing::info!(key = %rec.key(), reason = reason.as_str(), "server: closing session");
                }
            }
        }
    }
}

async fn sweep_loop(table: Arc<SessionTable>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(every.max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                for rec in table.sweep_closed() {
                    tracing::info!(key = %rec.key(), "server: evicted closed session");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natpunch::tunnel::frame::Mode;

    fn localhost() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    fn options() -> ServerOptions {
        ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            bind_ip: localhost(),
            forward_host: localhost(),
            codec: Codec::Plain,
            timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            ready_grace: Duration::from_secs(10),
        }
    }

    struct Peer {
        sock: UdpSocket,
        server: SocketAddr,
    }

    impl Peer {
        async fn register(srv: &Server) -> Self {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let key = sock.local_addr().unwrap().to_string();
            let port = srv.register(localhost(), &key).await.unwrap();
            Self {
                sock,
                server: SocketAddr::new(localhost(), port),
            }
        }

        fn key(&self) -> String {
            self.sock.local_addr().unwrap().to_string()
        }

        async fn send(&self, f: Frame) {
            let b = Codec::Plain.encode(&f).unwrap();
            self.sock.send_to(&b, self.server).await.unwrap();
        }

        async fn recv(&self) -> Frame {
            let mut buf = vec![0u8; RECV_BUFFER_BYTES];
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), self.sock.recv_from(&mut buf))
                .await
                .expect("recv timed out")
                .unwrap();
            Codec::Plain.decode(&buf[..n]).unwrap()
        }

        /// Keep-alive round trip; everything sent before it has been handled.
        async fn sync(&self) {
            self.send(Frame::keep_alive()).await;
            loop {
                if self.recv().await.flag == Flag::KeepAliveAck {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn announced_flow_is_dialed_and_answered() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;
        let svc = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let svc_port = svc.local_addr().unwrap().port();

        peer.send(Frame::dummy()).await;
        peer.send(Frame::mode(Mode::Tunnel)).await;
        peer.send(Frame::announce(0, svc_port)).await;
        peer.send(Frame::data(0, &b"ping"[..])).await;

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), svc.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        svc.send_to(b"pong", from).await.unwrap();
        let back = peer.recv().await;
        assert_eq!(back, Frame::data(0, &b"pong"[..]));

        let rec = srv.table().get(&peer.key()).unwrap();
        let snap = rec.snapshot().await;
        assert!(snap.ready);
        assert_eq!(snap.mode, Some(Mode::Tunnel));
        assert_eq!(snap.dialed_flows, 1);
        assert_eq!(rec.peer().await, Some(peer.sock.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn unknown_flow_is_dropped_without_dialing() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;

        peer.send(Frame::dummy()).await;
        peer.send(Frame::mode(Mode::Tunnel)).await;
        peer.send(Frame::data(5, &b"early"[..])).await;
        peer.sync().await;

        let snap = srv.table().get(&peer.key()).unwrap().snapshot().await;
        assert_eq!(snap.announced_flows, 0);
        assert_eq!(snap.dialed_flows, 0);
    }

    #[tokio::test]
    async fn port_before_mode_is_ignored() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;

        peer.send(Frame::dummy()).await;
        peer.send(Frame::announce(0, 9000)).await;
        peer.sync().await;
        let rec = srv.table().get(&peer.key()).unwrap();
        assert_eq!(rec.snapshot().await.announced_flows, 0);

        peer.send(Frame::mode(Mode::Vpn)).await;
        peer.send(Frame::announce(0, 9000)).await;
        peer.sync().await;
        assert_eq!(rec.snapshot().await.announced_flows, 1);
    }

    #[tokio::test]
    async fn post_sends_dummy_to_literal_key() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;
        srv.request_dummy(localhost(), &peer.key()).unwrap();
        assert_eq!(peer.recv().await.flag, Flag::Dummy);

        assert!(matches!(
            srv.request_dummy(localhost(), "10.9.9.9:1"),
            Err(RegisterError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn close_frame_evicts_record() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;
        peer.send(Frame::dummy()).await;
        peer.send(Frame::close()).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while srv.table().contains(&peer.key()) {
            assert!(Instant::now() < deadline, "record not evicted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn duplicate_and_malformed_keys() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;
        assert!(matches!(
            srv.register(localhost(), &peer.key()).await,
            Err(RegisterError::Duplicate(_))
        ));
        assert!(!srv.table().is_blocked(localhost()));

        let caller = IpAddr::from([192, 0, 2, 1]);
        assert!(matches!(
            srv.register(caller, "999.999.999.999:70000").await,
            Err(RegisterError::Malformed(_))
        ));
        assert!(srv.table().is_blocked(caller));
        assert!(matches!(
            srv.register(caller, "192.0.2.1:4000").await,
            Err(RegisterError::Blocked)
        ));
    }

    #[tokio::test]
    async fn stopped_record_sends_close_frame() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;
        peer.send(Frame::dummy()).await;
        peer.sync().await;

        srv.table().get(&peer.key()).unwrap().close();
        loop {
            if peer.recv().await.flag == Flag::Close {
                break;
            }
        }
    }

    #[tokio::test]
    async fn replies_follow_rebound_client_address() {
        let srv = Server::new(options());
        let a = Peer::register(&srv).await;
        let svc = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let svc_port = svc.local_addr().unwrap().port();

        a.send(Frame::dummy()).await;
        a.send(Frame::mode(Mode::Tunnel)).await;
        a.send(Frame::announce(0, svc_port)).await;
        a.sync().await;

        // Same session, new source port after a NAT rebind.
        let b = Peer {
            sock: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server: a.server,
        };
        b.send(Frame::data(0, &b"ping"[..])).await;

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), svc.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        svc.send_to(b"pong", from).await.unwrap();

        assert_eq!(b.recv().await, Frame::data(0, &b"pong"[..]));
        let rec = srv.table().get(&a.key()).unwrap();
        assert_eq!(rec.peer().await, Some(b.sock.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn traffic_without_dummy_marks_record_ready() {
        let srv = Server::new(options());
        let peer = Peer::register(&srv).await;
        let svc = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let svc_port = svc.local_addr().unwrap().port();

        peer.send(Frame::mode(Mode::Tunnel)).await;
        peer.send(Frame::announce(0, svc_port)).await;
        peer.send(Frame::data(0, &b"ping"[..])).await;

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), svc.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        let rec = srv.table().get(&peer.key()).unwrap();
        assert!(rec.liveness().is_ready());

        // Still receiving past the grace period: not evicted.
        let grace = Duration::from_secs(10);
        let later = rec.liveness().created_at() + grace + Duration::from_secs(1);
        rec.liveness().touch_at(later);
        assert!(srv.table().check_liveness_at(later, grace).is_empty());
        assert!(!rec.should_close());
    }
}
