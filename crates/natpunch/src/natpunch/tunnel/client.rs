use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use serde::Serialize;
use tokio::{net::UdpSocket, sync::watch, task::JoinSet, time::Instant};

use crate::natpunch::{
    telemetry::{self, Side},
    tunnel::{
        flows::{Assigned, ClientFlows},
        frame::{Codec, Flag, Frame, Mode},
        handshake::{Handshake, Punched},
        liveness::{Attempt, Liveness, RetryBudget, Verdict},
        rendezvous::Rendezvous,
    },
};

const RECV_BUFFER_BYTES: usize = 64 * 1024;

/// Operator-facing lifecycle of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Connecting,
    Ready,
    Disconnected,
    Reconnecting,
    Stopped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Connecting => "connecting",
            Status::Ready => "ready",
            Status::Disconnected => "disconnected",
            Status::Reconnecting => "reconnecting",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_ip: IpAddr,
    pub bind_ip: IpAddr,
    pub mode: Mode,
    pub codec: Codec,
    /// Consecutive failed sessions tolerated; `0` retries forever.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub timeout: Duration,
}

/// A local UDP listener for one exposed service. Bound once and reused by
/// every tunnel session.
#[derive(Debug, Clone)]
pub struct ServiceListener {
    /// Port announced to the server for flows arriving here.
    pub port: u16,
    pub socket: Arc<UdpSocket>,
}

impl ServiceListener {
    pub fn new(port: u16, socket: Arc<UdpSocket>) -> Self {
        Self { port, socket }
    }

    pub async fn bind(listen_ip: IpAddr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(listen_ip, port)).await?;
        Ok(Self::new(port, Arc::new(socket)))
    }
}

pub async fn bind_services(listen_ip: IpAddr, ports: &[u16]) -> anyhow::Result<Vec<ServiceListener>> {
    let mut out = Vec::with_capacity(ports.len());
    for &port in ports {
        let l = ServiceListener::bind(listen_ip, port)
            .await
            .with_context(|| format!("client: bind service listener {listen_ip}:{port}"))?;
        tracing::info!(addr = %SocketAddr::new(listen_ip, port), "client: service listener bound");
        out.push(l);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    ClosedByPeer,
    Dead,
}

impl SessionEnd {
    fn as_str(self) -> &'static str {
        match self {
            SessionEnd::Shutdown => "shutdown",
            SessionEnd::ClosedByPeer => "closed by server",
            SessionEnd::Dead => "liveness timeout",
        }
    }
}

/// One live tunnel socket plus the state its tasks share.
struct Tunnel {
    socket: Arc<UdpSocket>,
    codec: Codec,
    mode: Mode,
    liveness: Liveness,
    flows: Arc<ClientFlows>,
}

impl Tunnel {
    async fn send(&self, frame: &Frame) -> anyhow::Result<()> {
        let b = self.codec.encode(frame)?;
        self.socket
            .send(&b)
            .await
            .with_context(|| format!("client: send {} frame", frame.flag.as_str()))?;
        telemetry::frame_tx(Side::Client, frame.flag);
        Ok(())
    }
}

pub struct Client {
    opts: ClientOptions,
    rendezvous: Arc<dyn Rendezvous>,
    listeners: Vec<ServiceListener>,
    flows: Arc<ClientFlows>,
    status: watch::Sender<Status>,
}

impl Client {
    pub fn new(opts: ClientOptions, rendezvous: Arc<dyn Rendezvous>, listeners: Vec<ServiceListener>) -> Self {
        let (status, _rx) = watch::channel(Status::Connecting);
        Self {
            opts,
            rendezvous,
            listeners,
            flows: Arc::new(ClientFlows::new()),
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    fn set_status(&self, st: Status) {
        self.status.send_replace(st);
    }

    /// Runs sessions until shutdown or until the retry budget is spent.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut budget = RetryBudget::new(self.opts.retry_count);
        loop {
            if *shutdown.borrow() {
                self.set_status(Status::Stopped);
                return Ok(());
            }

            self.set_status(Status::Connecting);
            tracing::info!(server_ip = %self.opts.server_ip, "client: connecting");
            match self.run_session(&mut budget, shutdown.clone()).await {
                Ok(SessionEnd::Shutdown) => {
                    self.set_status(Status::Stopped);
                    return Ok(());
                }
                Ok(end) => tracing::warn!(reason = end.as_str(), "client: disconnected"),
                Err(err) => tracing::warn!(err = %format!("{err:#}"), "client: disconnected"),
            }
            self.set_status(Status::Disconnected);

            match budget.record_failure() {
                Attempt::Exhausted { failures } => {
                    self.set_status(Status::Stopped);
                    anyhow::bail!("client: giving up after {failures} consecutive failed sessions");
                }
                Attempt::Retry { failures } => {
                    telemetry::client_reconnect();
                    tracing::info!(
                        failures,
                        delay = %humantime::format_duration(self.opts.retry_delay),
                        "client: reconnecting"
                    );
                    self.set_status(Status::Reconnecting);
                }
            }

            tokio::select! {
                _ = stopped(&mut shutdown) => {
                    self.set_status(Status::Stopped);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.opts.retry_delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        budget: &mut RetryBudget,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<SessionEnd> {
        let mut hs = Handshake::new(
            self.rendezvous.as_ref(),
            self.opts.server_ip,
            self.opts.bind_ip,
            self.opts.codec,
        );
        let punched = tokio::select! {
            res = hs.open() => res?,
            _ = stopped(&mut shutdown) => return Ok(SessionEnd::Shutdown),
        };

        let tunnel = Arc::new(Tunnel {
            socket: punched.socket.clone(),
            codec: self.opts.codec,
            mode: self.opts.mode,
            liveness: Liveness::new(self.opts.timeout),
            flows: self.flows.clone(),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let res = self
            .drive(&mut hs, &punched, &tunnel, budget, &mut tasks, stop_rx, shutdown)
            .await;

        stop_tx.send_replace(true);
        tasks.shutdown().await;
        self.flows.clear().await;
        tracing::debug!(local_port = punched.local_port, "client: tunnel torn down");
        res
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        hs: &mut Handshake<'_>,
        punched: &Punched,
        tunnel: &Arc<Tunnel>,
        budget: &mut RetryBudget,
        tasks: &mut JoinSet<anyhow::Result<SessionEnd>>,
        stop: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<SessionEnd> {
        let (ready_tx, mut ready_rx) = watch::channel(false);
        tasks.spawn(recv_loop(tunnel.clone(), ready_tx, stop.clone()));

        tokio::select! {
            res = hs.await_peer(punched, &mut ready_rx, self.opts.handshake_timeout) => res?,
            _ = stopped(&mut shutdown) => return Ok(SessionEnd::Shutdown),
        }

        budget.reset();
        self.set_status(Status::Ready);
        tracing::info!(
            local_port = punched.local_port,
            server = %punched.server,
            services = self.listeners.len(),
            "client: tunnel ready"
        );

        // Mode goes out before any port announcement.
        tunnel.send(&Frame::mode(tunnel.mode)).await?;
        for l in &self.listeners {
            tasks.spawn(listener_loop(tunnel.clone(), l.clone(), stop.clone()));
        }
        tasks.spawn(keepalive_loop(tunnel.clone(), self.opts.keepalive_interval, stop.clone()));
        tasks.spawn(liveness_loop(tunnel.clone(), stop));

        tokio::select! {
            _ = stopped(&mut shutdown) => {
                if let Err(err) = tunnel.send(&Frame::close()).await {
                    tracing::debug!(err = %err, "client: close frame not sent");
                }
                Ok(SessionEnd::Shutdown)
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(res)) => res,
                Some(Err(err)) => Err(anyhow::Error::new(err).context("client: session task failed")),
                None => Ok(SessionEnd::Dead),
            },
        }
    }
}

/// Resolves once `rx` reads `true` or its sender is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn recv_loop(
    tunnel: Arc<Tunnel>,
    ready: watch::Sender<bool>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<SessionEnd> {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        let n = tokio::select! {
            _ = stopped(&mut stop) => return Ok(SessionEnd::Shutdown),
            res = tunnel.socket.recv(&mut buf) => res.context("client: tunnel receive")?,
        };
        let frame = match tunnel.codec.decode(&buf[..n]) {
            Ok(f) => f,
            Err(err) => {
                tracing::debug!(err = %err, "client: malformed frame dropped");
                telemetry::frame_dropped(Side::Client, "malformed");
                continue;
            }
        };
        tunnel.liveness.touch();
        telemetry::frame_rx(Side::Client, frame.flag);

        match frame.flag {
            Flag::Dummy => {
                if tunnel.liveness.mark_ready() {
                    tracing::debug!("client: dummy frame received");
                    ready.send_replace(true);
                }
            }
            Flag::KeepAlive => tunnel.send(&Frame::keep_alive_ack()).await?,
            Flag::KeepAliveAck => {}
            Flag::Close => {
                tracing::info!("client: server closed the session");
                return Ok(SessionEnd::ClosedByPeer);
            }
            Flag::Data => deliver(&tunnel, frame).await,
            Flag::Announce | Flag::Mode => {
                tracing::debug!(flag = frame.flag.as_str(), flow = frame.flow, "client: unexpected frame dropped");
                telemetry::frame_dropped(Side::Client, "unexpected");
            }
        }
    }
}

async fn deliver(tunnel: &Tunnel, frame: Frame) {
    let Some((peer, listener)) = tunnel.flows.route(frame.flow).await else {
        tracing::debug!(flow = frame.flow, "client: data for unknown flow dropped");
        telemetry::frame_dropped(Side::Client, "unknown_flow");
        return;
    };
    if let Err(err) = listener.send_to(&frame.payload, peer).await {
        tracing::warn!(flow = frame.flow, peer = %peer, err = %err, "client: delivery to local peer failed");
    }
}

async fn listener_loop(
    tunnel: Arc<Tunnel>,
    listener: ServiceListener,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<SessionEnd> {
    let max = tunnel.codec.max_payload();
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        let (n, peer) = tokio::select! {
            _ = stopped(&mut stop) => return Ok(SessionEnd::Shutdown),
            res = listener.socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(port = listener.port, err = %err, "client: service listener read failed");
                    continue;
                }
            },
        };
        if n > max {
            tracing::warn!(port = listener.port, peer = %peer, len = n, max, "client: oversized datagram dropped");
            telemetry::frame_dropped(Side::Client, "oversized");
            continue;
        }

        let flow = match tunnel.flows.assign(listener.port, peer, &listener.socket).await {
            Ok(Assigned::New(id)) => {
                // The server ignores announcements until it has seen a mode frame.
                tunnel.send(&Frame::mode(tunnel.mode)).await?;
                tunnel.send(&Frame::announce(id, listener.port)).await?;
                tracing::info!(flow = id, peer = %peer, port = listener.port, "client: flow opened");
                id
            }
            Ok(Assigned::Existing(id)) => id,
            Err(err) => {
                tracing::warn!(peer = %peer, port = listener.port, err = %err, "client: datagram dropped");
                telemetry::frame_dropped(Side::Client, "flows_exhausted");
                continue;
            }
        };
        tunnel
            .send(&Frame::data(flow, Bytes::copy_from_slice(&buf[..n])))
            .await?;
    }
}

async fn keepalive_loop(
    tunnel: Arc<Tunnel>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<SessionEnd> {
    let mut tick = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => return Ok(SessionEnd::Shutdown),
            _ = tick.tick() => tunnel.send(&Frame::keep_alive()).await?,
        }
    }
}

async fn liveness_loop(tunnel: Arc<Tunnel>, mut stop: watch::Receiver<bool>) -> anyhow::Result<SessionEnd> {
    let period = tunnel.liveness.timeout();
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => return Ok(SessionEnd::Shutdown),
            _ = tick.tick() => {
                if tunnel.liveness.verdict() == Verdict::Dead {
                    tracing::warn!(
                        timeout = %humantime::format_duration(period),
                        "client: no traffic from server; session dead"
                    );
                    return Ok(SessionEnd::Dead);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::natpunch::tunnel::rendezvous::RendezvousError;

    /// Plays the negotiator and server: each `register` call succeeds or fails
    /// per `outcomes` (missing entries succeed).
    struct ScriptedRendezvous {
        server: Arc<UdpSocket>,
        outcomes: Vec<bool>,
        close_after_dummy: bool,
        calls: AtomicUsize,
    }

    impl ScriptedRendezvous {
        async fn new(outcomes: Vec<bool>, close_after_dummy: bool) -> Arc<Self> {
            Arc::new(Self {
                server: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
                outcomes,
                close_after_dummy,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Rendezvous for ScriptedRendezvous {
        async fn register(&self, _local_port: u16) -> Result<u16, RendezvousError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.outcomes.get(i).copied().unwrap_or(true) {
                Ok(self.server.local_addr().unwrap().port())
            } else {
                Err(RendezvousError::NoNegotiator(1))
            }
        }

        async fn trigger_dummy(&self, local_port: u16) -> Result<(), RendezvousError> {
            let to = SocketAddr::from(([127, 0, 0, 1], local_port));
            let b = Codec::Plain.encode(&Frame::dummy()).unwrap();
            self.server.send_to(&b, to).await.unwrap();
            if self.close_after_dummy {
                let b = Codec::Plain.encode(&Frame::close()).unwrap();
                self.server.send_to(&b, to).await.unwrap();
            }
            Ok(())
        }
    }

    fn options(retry_count: u32) -> ClientOptions {
        let localhost = IpAddr::from([127, 0, 0, 1]);
        ClientOptions {
            server_ip: localhost,
            bind_ip: localhost,
            mode: Mode::Tunnel,
            codec: Codec::Plain,
            retry_count,
            retry_delay: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(3600),
        }
    }

    /// Next non-keep-alive frame arriving at the fake server.
    async fn next_frame(sock: &UdpSocket) -> (Frame, SocketAddr) {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        loop {
            let (n, from) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
                .await
                .expect("no frame from client")
                .unwrap();
            let f = Codec::Plain.decode(&buf[..n]).unwrap();
            if f.flag != Flag::KeepAlive {
                return (f, from);
            }
        }
    }

    #[test]
    fn status_prints_upper_case() {
        assert_eq!(Status::Reconnecting.to_string(), "RECONNECTING");
        assert_eq!(Status::Ready.as_str(), "ready");
    }

    #[tokio::test]
    async fn announces_then_forwards_both_ways() {
        let rdv = ScriptedRendezvous::new(vec![], false).await;
        let svc = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let svc_addr = svc.local_addr().unwrap();
        let client = Arc::new(Client::new(
            options(0),
            rdv.clone(),
            vec![ServiceListener::new(9000, svc)],
        ));

        let mut status = client.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(shutdown_rx).await }
        });

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == Status::Ready))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(next_frame(&rdv.server).await.0.flag, Flag::Dummy);
        let (mode, tunnel_addr) = next_frame(&rdv.server).await;
        assert_eq!(mode, Frame::mode(Mode::Tunnel));

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        app.send_to(b"hello", svc_addr).await.unwrap();
        assert_eq!(next_frame(&rdv.server).await.0, Frame::mode(Mode::Tunnel));
        assert_eq!(next_frame(&rdv.server).await.0, Frame::announce(0, 9000));
        assert_eq!(next_frame(&rdv.server).await.0, Frame::data(0, &b"hello"[..]));

        app.send_to(b"again", svc_addr).await.unwrap();
        assert_eq!(next_frame(&rdv.server).await.0, Frame::data(0, &b"again"[..]));

        // A second peer gets its own flow, again announced after a mode frame.
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        other.send_to(b"hi", svc_addr).await.unwrap();
        assert_eq!(next_frame(&rdv.server).await.0, Frame::mode(Mode::Tunnel));
        assert_eq!(next_frame(&rdv.server).await.0, Frame::announce(1, 9000));
        assert_eq!(next_frame(&rdv.server).await.0, Frame::data(1, &b"hi"[..]));

        let reply = Codec::Plain.encode(&Frame::data(0, &b"world"[..])).unwrap();
        rdv.server.send_to(&reply, tunnel_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), app.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(from, svc_addr);

        shutdown_tx.send_replace(true);
        assert_eq!(next_frame(&rdv.server).await.0.flag, Flag::Close);
        run.await.unwrap().unwrap();
        assert_eq!(*client.status().borrow(), Status::Stopped);
    }

    #[tokio::test]
    async fn gives_up_after_retry_count_failures() {
        let rdv = ScriptedRendezvous::new(vec![false; 16], false).await;
        let client = Client::new(options(3), rdv.clone(), vec![]);
        let (_tx, rx) = watch::channel(false);

        let err = client.run(rx).await.unwrap_err();
        assert!(err.to_string().contains("3 consecutive"), "{err}");
        assert_eq!(rdv.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*client.status().borrow(), Status::Stopped);
    }

    #[tokio::test]
    async fn ready_session_resets_failure_count() {
        // fail, fail, ready then closed by server, fail, fail
        let rdv = ScriptedRendezvous::new(vec![false, false, true, false, false, false], true).await;
        let client = Client::new(options(3), rdv.clone(), vec![]);
        let (_tx, rx) = watch::channel(false);

        client.run(rx).await.unwrap_err();
        assert_eq!(rdv.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn silent_server_is_declared_dead() {
        let rdv = ScriptedRendezvous::new(vec![true, false], false).await;
        let mut opts = options(1);
        opts.timeout = Duration::from_millis(200);
        let client = Client::new(opts, rdv.clone(), vec![]);
        let (_tx, rx) = watch::channel(false);

        let started = std::time::Instant::now();
        client.run(rx).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(rdv.calls.load(Ordering::SeqCst), 1);
    }
}
