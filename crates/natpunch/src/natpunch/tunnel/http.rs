use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{ConnectInfo, Path, State, connect_info::Connected},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tower_http::trace::TraceLayer;

use crate::natpunch::tunnel::{
    server::{RegisterError, Server},
    table::SessionTable,
};

/// Rendezvous routes. The session key is the last path segment, so both
/// `/{ip:port}` and `/{server_ip}/{ip:port}` work.
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/", get(probe))
        .route("/{*path}", get(register).post(trigger_dummy))
        .with_state(server)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    listener: TcpListener,
    server: Arc<Server>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = GuardedListener {
        inner: listener,
        table: server.table(),
    };
    let app = router(server);
    axum::serve(listener, app.into_make_service_with_connect_info::<Caller>())
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

/// Drops connections from blocklisted addresses before any HTTP is read.
struct GuardedListener {
    inner: TcpListener,
    table: Arc<SessionTable>,
}

impl axum::serve::Listener for GuardedListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    if self.table.is_blocked(addr.ip()) {
                        tracing::debug!(caller = %addr, "server: blocklisted caller dropped");
                        drop(stream);
                        continue;
                    }
                    return (stream, addr);
                }
                Err(err) => {
                    tracing::debug!(err = %err, "server: accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Remote address of an accepted rendezvous connection.
#[derive(Debug, Clone, Copy)]
struct Caller(SocketAddr);

impl Connected<axum::serve::IncomingStream<'_, GuardedListener>> for Caller {
    fn connect_info(stream: axum::serve::IncomingStream<'_, GuardedListener>) -> Self {
        Caller(*stream.remote_addr())
    }
}

fn session_key(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

async fn probe() -> StatusCode {
    StatusCode::OK
}

async fn register(
    State(server): State<Arc<Server>>,
    ConnectInfo(Caller(caller)): ConnectInfo<Caller>,
    Path(path): Path<String>,
) -> Result<String, RegisterError> {
    let port = server.register(caller.ip(), session_key(&path)).await?;
    Ok(port.to_string())
}

async fn trigger_dummy(
    State(server): State<Arc<Server>>,
    ConnectInfo(Caller(caller)): ConnectInfo<Caller>,
    Path(path): Path<String>,
) -> Result<StatusCode, RegisterError> {
    server.request_dummy(caller.ip(), session_key(&path))?;
    Ok(StatusCode::OK)
}

impl IntoResponse for RegisterError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegisterError::Malformed(_) => StatusCode::BAD_REQUEST,
            RegisterError::Duplicate(_) => StatusCode::CONFLICT,
            RegisterError::Allocate(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RegisterError::UnknownSession(_) => StatusCode::NOT_FOUND,
            RegisterError::Blocked => StatusCode::FORBIDDEN,
        };
        if status.is_server_error() {
            tracing::error!(err = %self, "server: registration failed");
        }
        let hang_up = matches!(self, RegisterError::Malformed(_) | RegisterError::Blocked);
        let mut res = (status, self.to_string()).into_response();
        if hang_up {
            res.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::natpunch::tunnel::{frame::Codec, server::ServerOptions};

    struct Running {
        base: String,
        server: Arc<Server>,
        _shutdown: watch::Sender<bool>,
    }

    async fn start() -> Running {
        let localhost = IpAddr::from([127, 0, 0, 1]);
        let server = Arc::new(Server::new(ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            bind_ip: localhost,
            forward_host: localhost,
            codec: Codec::Plain,
            timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            ready_grace: Duration::from_secs(10),
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, server.clone(), rx));
        Running {
            base,
            server,
            _shutdown: tx,
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn key_is_last_segment() {
        assert_eq!(session_key("1.2.3.4:5"), "1.2.3.4:5");
        assert_eq!(session_key("10.0.0.1/1.2.3.4:5"), "1.2.3.4:5");
        assert_eq!(session_key("a/b/"), "");
    }

    #[tokio::test]
    async fn register_trigger_and_conflicts() {
        let srv = start().await;
        let http = client();

        let res = http.head(&srv.base).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::OK);

        let url = format!("{}/127.0.0.1/127.0.0.1:45999", srv.base);
        let res = http.get(&url).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        let port: u16 = res.text().await.unwrap().parse().unwrap();
        assert_ne!(port, 0);
        assert_eq!(
            srv.server.table().get("127.0.0.1:45999").unwrap().local_port(),
            port
        );

        let res = http.get(&url).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::CONFLICT);

        let res = http.post(&url).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::OK);

        let res = http
            .post(format!("{}/127.0.0.1/10.9.9.9:1", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_key_blocklists_caller() {
        let srv = start().await;
        let http = client();

        let res = http
            .get(format!("{}/127.0.0.1/999.999.999.999:70000", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(srv.server.table().is_blocked(IpAddr::from([127, 0, 0, 1])));

        // New connections from the same address are dropped at accept.
        assert!(http.get(&srv.base).send().await.is_err());
    }
}
