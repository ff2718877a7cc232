pub mod client;
pub mod flows;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod liveness;
pub mod rendezvous;
pub mod server;
pub mod table;

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, sync::Arc, time::Duration};

    use tokio::{
        net::{TcpListener, UdpSocket},
        sync::watch,
    };

    use super::{
        client::{Client, ClientOptions, ServiceListener, Status},
        frame::{Codec, Mode},
        http,
        rendezvous::{HttpRendezvous, HttpRendezvousOptions},
        server::{Server, ServerOptions},
    };

    /// Client and server in one process, the server doubling as negotiator.
    #[tokio::test]
    async fn loopback_client_and_server() {
        let localhost = IpAddr::from([127, 0, 0, 1]);

        let server = Arc::new(Server::new(ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            bind_ip: localhost,
            forward_host: localhost,
            codec: Codec::Padded,
            timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            ready_grace: Duration::from_secs(10),
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (server_stop, server_stop_rx) = watch::channel(false);
        tokio::spawn(http::serve(listener, server.clone(), server_stop_rx));

        // The exposed service: echoes every datagram.
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let rendezvous = HttpRendezvous::new(HttpRendezvousOptions {
            negotiators: vec!["http://127.0.0.1:1".into(), base],
            server_ip: localhost,
            public_ip: Some(localhost),
            public_ip_url: String::new(),
            timeout: Duration::from_secs(2),
            insecure_skip_verify: false,
            resolve: vec![],
        })
        .unwrap();

        let svc = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let svc_addr = svc.local_addr().unwrap();
        let client = Arc::new(Client::new(
            ClientOptions {
                server_ip: localhost,
                bind_ip: localhost,
                mode: Mode::Tunnel,
                codec: Codec::Padded,
                retry_count: 1,
                retry_delay: Duration::from_millis(10),
                handshake_timeout: Duration::from_secs(5),
                keepalive_interval: Duration::from_millis(200),
                timeout: Duration::from_secs(15),
            },
            Arc::new(rendezvous),
            vec![ServiceListener::new(echo_port, svc)],
        ));

        let mut status = client.status();
        let (client_stop, client_stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(client_stop_rx).await }
        });
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == Status::Ready))
            .await
            .unwrap()
            .unwrap();

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        for msg in [&b"one"[..], &b"two"[..]] {
            app.send_to(msg, svc_addr).await.unwrap();
            let (n, from) = tokio::time::timeout(Duration::from_secs(5), app.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], msg);
            assert_eq!(from, svc_addr);
        }

        let snaps = server.table().snapshot().await;
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].ready);
        assert_eq!(snaps[0].mode, Some(Mode::Tunnel));
        assert_eq!(snaps[0].announced_flows, 1);
        assert_eq!(snaps[0].dialed_flows, 1);

        // Shutdown sends a close frame; the server drops the record.
        client_stop.send_replace(true);
        run.await.unwrap().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !server.table().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "record not evicted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server_stop.send_replace(true);
    }
}
