use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{net::UdpSocket, sync::watch};

use crate::natpunch::tunnel::{
    frame::{Codec, Frame, FrameError},
    rendezvous::{Rendezvous, RendezvousError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    PortReserved,
    DummySent,
    AwaitingPeerDummy,
    Ready,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("bind tunnel socket: {0}")]
    Bind(io::Error),
    #[error("rendezvous: {0}")]
    Rendezvous(#[from] RendezvousError),
    #[error("tunnel socket: {0}")]
    Transport(io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("no dummy frame from server within {0:?}")]
    Timeout(Duration),
    #[error("tunnel receiver stopped before the session became ready")]
    ReceiverGone,
}

/// A tunnel socket with an outbound NAT binding toward the server.
#[derive(Debug, Clone)]
pub struct Punched {
    pub socket: Arc<UdpSocket>,
    pub local_port: u16,
    pub server: SocketAddr,
}

/// Client side of hole punching.
///
/// `open` covers reserving the local port, registering with the rendezvous
/// service and sending the first dummy frame. `await_peer` must only be called
/// once something is already reading the tunnel socket: it asks the server to
/// punch back and waits for that reader to report the dummy frame.
pub struct Handshake<'a> {
    rendezvous: &'a dyn Rendezvous,
    server_ip: IpAddr,
    bind_ip: IpAddr,
    codec: Codec,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(rendezvous: &'a dyn Rendezvous, server_ip: IpAddr, bind_ip: IpAddr, codec: Codec) -> Self {
        Self {
            rendezvous,
            server_ip,
            bind_ip,
            codec,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub async fn open(&mut self) -> Result<Punched, HandshakeError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0))
            .await
            .map_err(HandshakeError::Bind)?;
        let local_port = socket.local_addr().map_err(HandshakeError::Bind)?.port();
        self.state = HandshakeState::PortReserved;
        tracing::debug!(local_port, "handshake: tunnel port reserved");

        let server_port = self.rendezvous.register(local_port).await?;
        let server = SocketAddr::new(self.server_ip, server_port);

        socket.connect(server).await.map_err(HandshakeError::Transport)?;
        let dummy = self.codec.encode(&Frame::dummy())?;
        socket.send(&dummy).await.map_err(HandshakeError::Transport)?;
        self.state = HandshakeState::DummySent;
        tracing::info!(local_port, server = %server, "handshake: dummy frame sent");

        Ok(Punched {
            socket: Arc::new(socket),
            local_port,
            server,
        })
    }

    /// `ready` flips to `true` when the reader sees the server's dummy frame;
    /// the reader dropping its sender aborts the wait.
    pub async fn await_peer(
        &mut self,
        punched: &Punched,
        ready: &mut watch::Receiver<bool>,
        timeout: Duration,
    ) -> Result<(), HandshakeError> {
        self.rendezvous.trigger_dummy(punched.local_port).await?;
        self.state = HandshakeState::AwaitingPeerDummy;

        match tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await {
            Ok(Ok(_)) => {
                self.state = HandshakeState::Ready;
                Ok(())
            }
            Ok(Err(_)) => Err(HandshakeError::ReceiverGone),
            Err(_) => Err(HandshakeError::Timeout(timeout)),
        }
    }
}
