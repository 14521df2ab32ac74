//! The exposer: opens a couloir on a relay and keeps a pool of idle joined
//! sockets toward it, each of which becomes a pipe to a freshly dialed local
//! HTTP server when the relay announces `STREAM`.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use http::StatusCode;
use n0_error::{AnyError, Result, StackResultExt, StdResultExt, anyerr, e, stack_error};
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::mpsc,
};
use tokio_rustls::TlsConnector;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    DEFAULT_POOL_SIZE, PREFACE_MAX_LENGTH,
    parse::{HttpHead, HttpResponse},
    protocol::{self, AckPayload, ControlFrame, OpenPayload},
    util::{BoxedIo, Prebuffered, forward_bidi},
};

const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(15);

/// Exposer configuration, mirroring the `expose` CLI surface.
#[derive(Debug, Clone)]
pub struct ExposeOpts {
    /// Local port the couloir forwards to.
    pub local_port: u16,
    /// Relay domain (`--on`); also the TLS SNI name.
    pub relay_host: String,
    /// Relay port; defaults follow the mode (443 for TLS, 80 for HTTP).
    pub relay_port: u16,
    /// Dial this address instead of resolving `relay_host`.
    pub relay_ip: Option<IpAddr>,
    /// Requested couloir name (the subdomain label).
    pub name: Option<String>,
    /// Local server host.
    pub local_host: String,
    /// Rewrite the `Host` header of forwarded requests to this value.
    pub override_host: Option<String>,
    /// Talk to the relay over plain TCP instead of TLS.
    pub http: bool,
    /// Shared relay password.
    pub password: Option<String>,
    /// Number of idle joined sockets kept toward the relay.
    pub concurrency: usize,
}

impl ExposeOpts {
    pub fn new(local_port: u16, relay_host: impl Into<String>) -> Self {
        Self {
            local_port,
            relay_host: relay_host.into(),
            relay_port: 443,
            relay_ip: None,
            name: None,
            local_host: "127.0.0.1".into(),
            override_host: None,
            http: false,
            password: None,
            concurrency: DEFAULT_POOL_SIZE,
        }
    }
}

/// Exposer-side failures; [`ExposeError::Rejected`] carries the relay's own
/// error message and terminates the process.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ExposeError {
    #[error("invalid exposer configuration")]
    Config { source: AnyError },
    #[error("relay rejected the request: {message}")]
    Rejected { message: String },
    #[error("relay misbehaved")]
    Protocol { source: AnyError },
}

/// Events the pool members report to the supervisor.
enum PoolEvent {
    /// A member left the idle set to serve a stream; refill.
    Streaming,
    /// A member lost its relay connection before streaming; replace it.
    Disconnected,
    /// A member hit a control-protocol rejection; tear the exposer down.
    Fatal(ExposeError),
}

/// Opens the couloir and keeps the pool topped up until a fatal error.
///
/// Runs forever in the happy case; the caller usually races it against
/// ctrl-c.
pub async fn run(opts: ExposeOpts) -> Result<(), ExposeError> {
    let dialer = RelayDialer::new(&opts)?;
    let mut conn = dialer.dial_with_backoff().await;

    let requested = opts
        .name
        .as_ref()
        .map(|name| format!("{name}.{}", opts.relay_host));
    let pool = Arc::new(Pool {
        opts,
        dialer,
        request_id: AtomicU64::new(1),
        member_id: AtomicU64::new(0),
    });

    let ack = conn
        .request(ControlFrame::open(
            OpenPayload {
                host: requested,
                password: pool.opts.password.clone(),
            },
            pool.next_request_id(),
        ))
        .await
        .map_err(|err| e!(ExposeError::Protocol, err))?;
    if let Some(message) = ack.error {
        return Err(e!(ExposeError::Rejected { message }));
    }
    let host = ack
        .host
        .ok_or_else(|| e!(ExposeError::Protocol, anyerr!("open ack without host")))?;
    let key = ack
        .key
        .ok_or_else(|| e!(ExposeError::Protocol, anyerr!("open ack without key")))?;
    let key = Arc::<str>::from(key);
    let scheme = if pool.opts.http { "http" } else { "https" };
    info!("couloir open: {scheme}://{host}");

    let (events_tx, mut events_rx) = mpsc::channel(16);
    // The socket that opened the couloir joins it too and becomes the first
    // idle member; the rest of the pool dials fresh connections.
    pool.spawn_member(key.clone(), Some(conn), events_tx.clone());
    for _ in 1..pool.opts.concurrency.max(1) {
        pool.spawn_member(key.clone(), None, events_tx.clone());
    }

    while let Some(event) = events_rx.recv().await {
        match event {
            PoolEvent::Streaming | PoolEvent::Disconnected => {
                pool.spawn_member(key.clone(), None, events_tx.clone());
            }
            PoolEvent::Fatal(err) => return Err(err),
        }
    }
    Ok(())
}

struct Pool {
    opts: ExposeOpts,
    dialer: RelayDialer,
    request_id: AtomicU64,
    member_id: AtomicU64,
}

impl Pool {
    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn spawn_member(
        self: &Arc<Self>,
        key: Arc<str>,
        conn: Option<RelayConn>,
        events: mpsc::Sender<PoolEvent>,
    ) {
        let id = self.member_id.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(
            async move {
                this.run_member(key, conn, events).await;
            }
            .instrument(error_span!("member", id)),
        );
    }

    /// One pool member: join, idle until `STREAM`, then serve one request.
    async fn run_member(
        self: Arc<Self>,
        key: Arc<str>,
        conn: Option<RelayConn>,
        events: mpsc::Sender<PoolEvent>,
    ) {
        let mut conn = match conn {
            Some(conn) => conn,
            None => self.dialer.dial_with_backoff().await,
        };

        let ack = match conn
            .request(ControlFrame::join(key.to_string(), self.next_request_id()))
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                warn!("join failed: {err:#}");
                // Brief pause so a relay in a bad state is not hammered.
                tokio::time::sleep(Duration::from_secs(1)).await;
                events.send(PoolEvent::Disconnected).await.ok();
                return;
            }
        };
        if let Some(message) = ack.error {
            events
                .send(PoolEvent::Fatal(e!(ExposeError::Rejected { message })))
                .await
                .ok();
            return;
        }
        debug!("joined, idle");

        // Idle until the relay announces a client.
        match conn.recv().await {
            Ok(ControlFrame::Stream { .. }) => {}
            Ok(frame) => {
                warn!("unexpected frame while idle: {frame:?}");
                events.send(PoolEvent::Disconnected).await.ok();
                return;
            }
            Err(err) => {
                debug!("relay connection lost while idle: {err:#}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                events.send(PoolEvent::Disconnected).await.ok();
                return;
            }
        }
        // From here the socket is a raw pipe; a replacement restores the
        // pool's concurrency headroom while this one serves its request.
        events.send(PoolEvent::Streaming).await.ok();
        if let Err(err) = self.serve_stream(conn).await {
            warn!("stream failed: {err:#}");
        }
    }

    /// Pipes one spliced client request into a fresh local connection.
    async fn serve_stream(&self, mut conn: RelayConn) -> Result<()> {
        let local_addr = (self.opts.local_host.as_str(), self.opts.local_port);
        let local = match TcpStream::connect(local_addr).await {
            Ok(local) => local,
            Err(err) => {
                warn!(
                    "failed to reach local server on {}:{}: {err:#}",
                    self.opts.local_host, self.opts.local_port
                );
                let response = HttpResponse::html(
                    StatusCode::BAD_GATEWAY,
                    format!(
                        "<html><body><h1>502 Bad Gateway</h1>\
                         <p>The couloir is open but nothing answered on local port {}.</p>\
                         </body></html>",
                        self.opts.local_port
                    ),
                );
                response.write(&mut conn.write).await.anyerr()?;
                return Ok(());
            }
        };
        let (mut local_read, mut local_write) = local.into_split();

        if let Some(override_host) = &self.opts.override_host {
            // Peek the forwarded head and swap the Host header before the
            // local server sees it.
            let (header_len, _head) = HttpHead::peek(&mut conn.read).await?;
            let head = rewrite_host(&conn.read.buffer()[..header_len], override_host);
            local_write.write_all(&head).await.anyerr()?;
            conn.read.discard(header_len);
        }

        let (from_relay, from_local) = forward_bidi(
            &mut conn.read,
            &mut conn.write,
            &mut local_read,
            &mut local_write,
        )
        .await?;
        debug!(from_relay, from_local, "stream finished");
        Ok(())
    }
}

/// Dials the relay, optionally through TLS with SNI set to the relay domain.
struct RelayDialer {
    addr: String,
    server_name: ServerName<'static>,
    tls: Option<TlsConnector>,
}

/// A control connection to the relay, split so the read side can prebuffer
/// control lines while writes go out directly.
struct RelayConn {
    read: Prebuffered<ReadHalf<BoxedIo>>,
    write: WriteHalf<BoxedIo>,
}

impl RelayDialer {
    fn new(opts: &ExposeOpts) -> Result<Self, ExposeError> {
        let addr = match opts.relay_ip {
            Some(ip) => format!("{ip}:{}", opts.relay_port),
            None => format!("{}:{}", opts.relay_host, opts.relay_port),
        };
        let tls = if opts.http {
            None
        } else {
            let mut roots = rustls::RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for err in native.errors {
                debug!("skipping unreadable native root certificate: {err}");
            }
            for cert in native.certs {
                roots.add(cert).ok();
            }
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Some(TlsConnector::from(Arc::new(config)))
        };
        let server_name = ServerName::try_from(opts.relay_host.clone())
            .map_err(|err| e!(ExposeError::Config, anyerr!("invalid relay host: {err}")))?;
        Ok(Self {
            addr,
            server_name,
            tls,
        })
    }

    async fn dial(&self) -> Result<RelayConn> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .std_context("failed to reach relay")?;
        let io: BoxedIo = match &self.tls {
            Some(connector) => Box::new(
                connector
                    .connect(self.server_name.clone(), tcp)
                    .await
                    .std_context("TLS handshake with relay failed")?,
            ),
            None => Box::new(tcp),
        };
        let (read, write) = tokio::io::split(io);
        Ok(RelayConn {
            read: Prebuffered::new(read, PREFACE_MAX_LENGTH),
            write,
        })
    }

    /// Dials until it succeeds, with exponential backoff and jitter.
    async fn dial_with_backoff(&self) -> RelayConn {
        let mut delay = BACKOFF_INITIAL;
        loop {
            match self.dial().await {
                Ok(conn) => return conn,
                Err(err) => {
                    let jitter = rand::rng().random_range(0..=delay.as_millis() as u64);
                    let wait = delay + Duration::from_millis(jitter);
                    warn!("{err:#}; retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(BACKOFF_MAX);
                }
            }
        }
    }
}

impl RelayConn {
    async fn send(&mut self, frame: ControlFrame) -> Result<()> {
        let line = frame.encode()?;
        self.write.write_all(line.as_bytes()).await?;
        self.write.flush().await?;
        Ok(())
    }

    /// Reads one control line from the relay.
    async fn recv(&mut self) -> Result<ControlFrame> {
        loop {
            if let Some(end) = protocol::find_line_end(self.read.buffer()) {
                let frame = ControlFrame::parse(&self.read.buffer()[..end - 2])
                    .context("invalid control line from relay")?;
                self.read.discard(end);
                return Ok(frame);
            }
            if self.read.is_full() {
                return Err(anyerr!("oversized control line from relay"));
            }
            if self.read.buffer_more().await? == 0 {
                return Err(anyerr!("relay closed the connection"));
            }
        }
    }

    /// Sends a request frame and awaits its matching `ACK`.
    async fn request(&mut self, frame: ControlFrame) -> Result<AckPayload> {
        let id = frame.id();
        self.send(frame).await?;
        match self.recv().await? {
            ControlFrame::Ack { payload, id: ack_id } if ack_id == id => Ok(payload),
            frame => Err(anyerr!("expected ack for request {id}, got {frame:?}")),
        }
    }
}

/// Replaces the `Host` header line within a request head.
fn rewrite_host(head: &[u8], override_host: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len());
    let mut rest = head;
    while let Some(end) = protocol::find_line_end(rest) {
        let line = &rest[..end];
        let is_host = line
            .splitn(2, |&b| b == b':')
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case(b"host"));
        if is_host {
            out.extend_from_slice(format!("Host: {override_host}\r\n").as_bytes());
        } else {
            out.extend_from_slice(line);
        }
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);
    out
}
