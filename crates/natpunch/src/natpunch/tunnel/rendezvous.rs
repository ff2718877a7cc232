use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} answered {status}")]
    Status {
        method: &'static str,
        url: String,
        status: StatusCode,
    },
    #[error("bad port in response body: {0:?}")]
    BadPort(String),
    #[error("bad public ip: {0:?}")]
    BadPublicIp(String),
    #[error("no negotiator answered (tried {0})")]
    NoNegotiator(usize),
}

/// Address exchange with the negotiator.
///
/// `local_port` is the client's tunnel port; the negotiator pairs it with the
/// client's public IP to form the session key the server sees.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Registers the tunnel port and returns the server's port for this session.
    async fn register(&self, local_port: u16) -> Result<u16, RendezvousError>;

    /// Asks the server to send a dummy frame toward the client.
    async fn trigger_dummy(&self, local_port: u16) -> Result<(), RendezvousError>;
}

#[derive(Debug, Clone)]
pub struct HttpRendezvousOptions {
    pub negotiators: Vec<String>,
    pub server_ip: IpAddr,
    /// Skips public IP discovery when set.
    pub public_ip: Option<IpAddr>,
    pub public_ip_url: String,
    pub timeout: Duration,
    pub insecure_skip_verify: bool,
    /// Static host overrides for the HTTP client (`host -> ip`).
    pub resolve: Vec<(String, IpAddr)>,
}

/// [`Rendezvous`] over the negotiator's HTTP contract:
/// `GET|POST {negotiator}/{server_ip}/{public_ip}:{port}`.
///
/// The negotiator and public IP are resolved on first use and forgotten when a
/// registration fails, so every handshake attempt can re-probe.
#[derive(Debug)]
pub struct HttpRendezvous {
    http: reqwest::Client,
    opts: HttpRendezvousOptions,
    endpoint: Mutex<Option<Endpoint>>,
}

#[derive(Debug, Clone)]
struct Endpoint {
    negotiator: String,
    public_ip: IpAddr,
}

impl HttpRendezvous {
    pub fn new(opts: HttpRendezvousOptions) -> Result<Self, RendezvousError> {
        let mut b = reqwest::Client::builder()
            .timeout(opts.timeout)
            .danger_accept_invalid_certs(opts.insecure_skip_verify);
        for (host, ip) in &opts.resolve {
            // Port is ignored by reqwest; the URL's port wins.
            b = b.resolve(host, SocketAddr::new(*ip, 0));
        }
        Ok(Self {
            http: b.build()?,
            opts,
            endpoint: Mutex::new(None),
        })
    }

    /// Picks the first negotiator answering `HEAD` with 200 and resolves the
    /// client's public IP, reusing the last result while it keeps working.
    async fn endpoint(&self) -> Result<Endpoint, RendezvousError> {
        let mut cached = self.endpoint.lock().await;
        if let Some(ep) = cached.as_ref() {
            return Ok(ep.clone());
        }

        let negotiator = select_negotiator(&self.http, &self.opts.negotiators).await?;
        let public_ip = match self.opts.public_ip {
            Some(ip) => ip,
            None => discover_public_ip(&self.http, &self.opts.public_ip_url).await?,
        };
        tracing::info!(
            negotiator = %negotiator,
            public_ip = %public_ip,
            server_ip = %self.opts.server_ip,
            "rendezvous: ready"
        );
        let ep = Endpoint { negotiator, public_ip };
        *cached = Some(ep.clone());
        Ok(ep)
    }

    async fn forget_endpoint(&self) {
        self.endpoint.lock().await.take();
    }

    fn url(&self, ep: &Endpoint, local_port: u16) -> String {
        format!(
            "{}/{}/{}:{}",
            ep.negotiator.trim_end_matches('/'),
            self.opts.server_ip,
            ep.public_ip,
            local_port
        )
    }

    async fn try_register(&self, local_port: u16) -> Result<u16, RendezvousError> {
        let ep = self.endpoint().await?;
        let url = self.url(&ep, local_port);
        let res = self.http.get(&url).send().await?;
        let status = res.status();
        if status != StatusCode::OK {
            return Err(RendezvousError::Status {
                method: "GET",
                url,
                status,
            });
        }
        let body = res.text().await?;
        let port = parse_port(&body)?;
        tracing::debug!(url = %url, server_port = port, "rendezvous: registered");
        Ok(port)
    }
}

#[async_trait]
impl Rendezvous for HttpRendezvous {
    async fn register(&self, local_port: u16) -> Result<u16, RendezvousError> {
        let res = self.try_register(local_port).await;
        if res.is_err() {
            self.forget_endpoint().await;
        }
        res
    }

    async fn trigger_dummy(&self, local_port: u16) -> Result<(), RendezvousError> {
        let ep = self.endpoint().await?;
        let url = self.url(&ep, local_port);
        let res = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .send()
            .await?;
        let status = res.status();
        if status != StatusCode::OK {
            return Err(RendezvousError::Status {
                method: "POST",
                url,
                status,
            });
        }
        Ok(())
    }
}

async fn select_negotiator(
    http: &reqwest::Client,
    negotiators: &[String],
) -> Result<String, RendezvousError> {
    for n in negotiators {
        let n = n.trim();
        if n.is_empty() {
            continue;
        }
        match http.head(n).send().await {
            Ok(res) if res.status() == StatusCode::OK => {
                return Ok(n.trim_end_matches('/').to_string());
            }
            Ok(res) => {
                tracing::warn!(negotiator = %n, status = %res.status(), "rendezvous: negotiator rejected probe");
            }
            Err(err) => {
                tracing::warn!(negotiator = %n, err = %err, "rendezvous: negotiator unreachable");
            }
        }
    }
    Err(RendezvousError::NoNegotiator(negotiators.len()))
}

async fn discover_public_ip(http: &reqwest::Client, url: &str) -> Result<IpAddr, RendezvousError> {
    let res = http.get(url).send().await?;
    let status = res.status();
    if status != StatusCode::OK {
        return Err(RendezvousError::Status {
            method: "GET",
            url: url.to_string(),
            status,
        });
    }
    let body = res.text().await?;
    match body.trim().parse::<IpAddr>() {
        Ok(ip) => Ok(ip),
        Err(_) => Err(RendezvousError::BadPublicIp(body.clone())),
    }
}

pub fn parse_port(body: &str) -> Result<u16, RendezvousError> {
    match body.trim().parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(RendezvousError::BadPort(body.to_string())),
    }
}
