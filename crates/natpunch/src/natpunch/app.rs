use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::natpunch::{
    admin,
    config::{self, ClientConfig, Role, ServerConfig},
    logging, net, telemetry,
    tunnel::{
        client::{self, Client, ClientOptions, Status},
        frame::Codec,
        rendezvous::{HttpRendezvous, HttpRendezvousOptions},
        server::{Server, ServerOptions},
        table::SessionTable,
    },
};

pub async fn run(config_path: Option<PathBuf>, role_override: Option<Role>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path, role_override)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        role = cfg.role.as_str(),
        admin_addr = %cfg.admin_addr,
        "natpunch: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let mut sessions: Option<Arc<SessionTable>> = None;
    let mut status: Option<watch::Receiver<Status>> = None;

    match cfg.role {
        Role::Server => {
            let sc = cfg.server.as_ref().context("config: [server] section missing")?;
            let server = Arc::new(Server::new(server_options(sc)));
            sessions = Some(server.table());

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server.listen_and_serve(shutdown).await });
        }
        Role::Client => {
            let cc = cfg.client.as_ref().context("config: [client] section missing")?;
            let listeners = client::bind_services(cc.listen_ip, &cc.services).await?;
            let rendezvous = HttpRendezvous::new(rendezvous_options(cc)).context("client: rendezvous setup")?;

            let c = Arc::new(Client::new(client_options(cc), Arc::new(rendezvous), listeners));
            let rx = c.status();
            status = Some(rx.clone());

            let shutdown = shutdown_rx.clone();
            tasks.spawn(print_status(rx, shutdown.clone()));
            tasks.spawn(async move { c.run(shutdown).await });
        }
    }

    if !cfg.admin_addr.is_empty() {
        let addr: SocketAddr = net::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            role: cfg.role,
            prom: prom.clone(),
            sessions,
            status,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Wait for a signal or the first task to end; either way the rest follow.
    let mut outcome = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => outcome = Err(err),
                Some(Err(join_err)) => outcome = Err(join_err.into()),
            }
        }
    }
    shutdown_tx.send_replace(true);

    // The status printer can finish before the client task it reports on, so
    // a later error still decides the exit status.
    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                if outcome.is_ok() {
                    outcome = Err(err);
                } else {
                    tracing::debug!(err = %format!("{err:#}"), "shutdown: task ended with error");
                }
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

fn server_options(sc: &ServerConfig) -> ServerOptions {
    ServerOptions {
        listen_addr: sc.listen_addr.clone(),
        bind_ip: sc.bind_ip,
        forward_host: sc.forward_host,
        codec: Codec::from_padding(sc.padding),
        timeout: sc.timeout,
        sweep_interval: sc.sweep_interval,
        ready_grace: sc.ready_grace,
    }
}

fn client_options(cc: &ClientConfig) -> ClientOptions {
    ClientOptions {
        server_ip: cc.server_ip,
        bind_ip: cc.bind_ip,
        mode: cc.mode,
        codec: Codec::from_padding(cc.padding),
        retry_count: cc.retry_count,
        retry_delay: cc.retry_delay,
        handshake_timeout: cc.handshake_timeout,
        keepalive_interval: cc.keepalive_interval,
        timeout: cc.timeout,
    }
}

fn rendezvous_options(cc: &ClientConfig) -> HttpRendezvousOptions {
    HttpRendezvousOptions {
        negotiators: cc.negotiators.clone(),
        server_ip: cc.server_ip,
        public_ip: cc.public_ip,
        public_ip_url: cc.public_ip_url.clone(),
        timeout: cc.http_timeout,
        insecure_skip_verify: cc.insecure_skip_verify,
        resolve: cc.resolve.clone(),
    }
}

/// Operator-facing lifecycle lines on stdout.
async fn print_status(mut rx: watch::Receiver<Status>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut last = None;
    loop {
        let st = *rx.borrow_and_update();
        if last != Some(st) {
            println!("{st}");
            tracing::info!(status = st.as_str(), "client: status");
            last = Some(st);
        }
        if st == Status::Stopped {
            return Ok(());
        }
        tokio::select! {
            res = rx.changed() => {
                if res.is_err() {
                    return Ok(());
                }
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    // Let the client publish STOPPED before exiting.
                    if tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == Status::Stopped)).await.is_ok() {
                        println!("{}", Status::Stopped);
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
