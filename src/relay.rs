//! The relay: accepts raw TCP (optionally wrapped in TLS), classifies every
//! socket as either an exposer control connection or an ordinary HTTP
//! client, and pairs clients with idle exposer sockets per couloir.
//!
//! Control traffic and HTTP share one port; the first preface line decides
//! which path a socket takes, and a socket's role never changes afterwards.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use http::StatusCode;
use n0_error::{AnyError, Result, anyerr, e, stack_error};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    DEFAULT_HEADER_READ_TIMEOUT, PREFACE_MAX_LENGTH,
    cert::CertService,
    parse::{self, HttpHead, HttpResponse},
    protocol::{self, AckPayload, ControlFrame},
    relay::registry::{ExposerSlot, PendingClient, Registry},
    util::{BoxedIo, Prebuffered, forward_bidi},
};

pub(crate) mod registry;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayOpts {
    /// The domain whose wildcard DNS record points at this relay.
    pub domain: String,
    /// Shared password required by `OPEN_COULOIR`, if any.
    pub password: Option<String>,
    /// How long a socket may take to deliver its preface.
    pub header_read_timeout: Duration,
}

impl RelayOpts {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            password: None,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }

    pub fn password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }
}

/// Socket-level relay failures and how they answer the peer.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum RelayError {
    /// The preface is neither a control line nor an HTTP request.
    #[error("invalid preface")]
    InvalidProtocol { source: AnyError },
    /// The preface did not arrive within the header read timeout.
    #[error("timed out reading preface")]
    HeaderTimeout,
    /// The peer disconnected before sending a single byte. Benign.
    #[error("socket closed before any preface bytes")]
    EarlySocketClosed,
    /// Everything else; the socket is simply dropped.
    #[error("io error")]
    Io { source: AnyError },
}

impl RelayError {
    fn should_reply(&self) -> Option<StatusCode> {
        match self {
            RelayError::InvalidProtocol { .. } => Some(StatusCode::BAD_REQUEST),
            RelayError::HeaderTimeout { .. } => Some(StatusCode::REQUEST_TIMEOUT),
            RelayError::EarlySocketClosed { .. } | RelayError::Io { .. } => None,
        }
    }

    fn is_benign(&self) -> bool {
        matches!(self, RelayError::EarlySocketClosed { .. })
    }
}

/// What the first complete preface line says about a socket.
enum Classified {
    /// Starts with a known control tag: an exposer control connection.
    Control,
    /// A plausible HTTP request line: a client.
    Http,
}

/// The public-side tunnel endpoint.
pub struct Relay {
    registry: Registry,
    opts: RelayOpts,
    tls: Option<TlsAcceptor>,
    cert: Option<Arc<CertService>>,
    conn_id: AtomicU64,
    stream_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Relay {
    /// A plain-HTTP relay (`--http` mode); also what the tests run against.
    pub fn new(opts: RelayOpts) -> Arc<Self> {
        Self::build(opts, None, None)
    }

    /// A TLS relay serving certificates from `cert` via SNI.
    pub fn with_tls(opts: RelayOpts, acceptor: TlsAcceptor, cert: Arc<CertService>) -> Arc<Self> {
        Self::build(opts, Some(acceptor), Some(cert))
    }

    fn build(
        opts: RelayOpts,
        tls: Option<TlsAcceptor>,
        cert: Option<Arc<CertService>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(opts.domain.clone(), opts.password.clone()),
            opts,
            tls,
            cert,
            conn_id: AtomicU64::new(0),
            stream_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Accepts connections until the listener fails or [`Relay::shutdown`]
    /// is called. Every accepted socket runs in its own task.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => {
                    debug!("listener closed");
                    return Ok(());
                }
            };
            let (stream, peer_addr) = accepted?;
            let id = self.conn_id.fetch_add(1, Ordering::SeqCst);
            let token = self.shutdown.child_token();
            let this = self.clone();
            self.tasks.spawn(
                token
                    .run_until_cancelled_owned(async move {
                        debug!(%peer_addr, "accepted connection");
                        this.handle_socket(stream, id).await;
                    })
                    .instrument(error_span!("conn", id)),
            );
        }
    }

    /// Stops accepting sockets and cancels every bound pair.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} pending tasks)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all sockets closed cleanly"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "not all sockets closed in time, abort"
            ),
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, id: u64) {
        let io: BoxedIo = match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => Box::new(tls),
                Err(err) => {
                    // Usually a cold SNI miss while the certificate order runs.
                    warn!("TLS handshake failed: {err:#}");
                    return;
                }
            },
            None => Box::new(stream),
        };
        let mut io = Prebuffered::new(io, PREFACE_MAX_LENGTH);

        let classified = match self.classify(&mut io).await {
            Ok(classified) => classified,
            Err(err) => {
                if err.is_benign() {
                    debug!("socket closed before any preface bytes");
                } else {
                    warn!("failed to classify socket: {err:#}");
                    if let Some(status) = err.should_reply() {
                        send_error_response(io.get_mut(), status).await.ok();
                    }
                }
                return;
            }
        };

        let res = match classified {
            Classified::Control => self.serve_control(io, id).await,
            Classified::Http => self.serve_client(io, id).await,
        };
        match res {
            Ok(()) => debug!("connection closed"),
            Err(err) => warn!("connection closed with error: {err:#}"),
        }
    }

    /// Buffers the preface until the first complete line settles the
    /// socket's role. Unknown first lines are `INVALID_PROTOCOL`.
    async fn classify(&self, io: &mut Prebuffered<BoxedIo>) -> Result<Classified, RelayError> {
        let read = async {
            loop {
                if let Some(end) = protocol::find_line_end(io.buffer()) {
                    let line = &io.buffer()[..end - 2];
                    return if protocol::looks_like_control(line) {
                        Ok(Classified::Control)
                    } else if parse::is_http_request_line(line) {
                        Ok(Classified::Http)
                    } else {
                        Err(e!(
                            RelayError::InvalidProtocol,
                            anyerr!("unrecognized preface line")
                        ))
                    };
                }
                if io.is_full() {
                    return Err(e!(
                        RelayError::InvalidProtocol,
                        anyerr!("preface exceeds {} bytes", PREFACE_MAX_LENGTH)
                    ));
                }
                let n = io
                    .buffer_more()
                    .await
                    .map_err(|err| e!(RelayError::Io, err.into()))?;
                if n == 0 {
                    return if io.buffer().is_empty() {
                        Err(e!(RelayError::EarlySocketClosed))
                    } else {
                        Err(e!(
                            RelayError::InvalidProtocol,
                            anyerr!("connection closed mid-preface")
                        ))
                    };
                }
            }
        };
        tokio::time::timeout(self.opts.header_read_timeout, read)
            .await
            .map_err(|_| e!(RelayError::HeaderTimeout))?
    }

    /// Runs the control exchange on an exposer socket: `OPEN_COULOIR` and
    /// `JOIN_COULOIR` requests, then parks the socket as an idle exposer.
    async fn serve_control(
        &self,
        io: Prebuffered<BoxedIo>,
        id: u64,
    ) -> Result<(), RelayError> {
        let mut opened = None;
        let res = self.control_phase(io, id, &mut opened).await;
        // A couloir opened on this socket may never have been joined; the
        // check only deletes it when nothing references it anymore.
        if let Some(host) = opened {
            self.registry.teardown_check(&host);
        }
        res
    }

    async fn control_phase(
        &self,
        mut io: Prebuffered<BoxedIo>,
        id: u64,
        opened: &mut Option<String>,
    ) -> Result<(), RelayError> {
        loop {
            let Some(frame) = self.read_control_frame(&mut io).await? else {
                debug!("control socket closed");
                return Ok(());
            };
            match frame {
                ControlFrame::Open { payload, id: request_id } => {
                    let ack = match self
                        .registry
                        .open(payload.host.as_deref(), payload.password.as_deref())
                    {
                        Ok((host, key)) => {
                            *opened = Some(host.clone());
                            self.spawn_cert_warm(host.clone());
                            AckPayload::opened(host, key)
                        }
                        Err(err) => {
                            debug!("open rejected: {err:#}");
                            AckPayload::error(&err)
                        }
                    };
                    let rejected = ack.error.is_some();
                    write_frame(io.get_mut(), ControlFrame::ack(ack, request_id)).await?;
                    if rejected {
                        // Control-layer errors close the failing socket only.
                        return Ok(());
                    }
                }
                ControlFrame::Join { payload, id: request_id } => {
                    let host = match self.registry.resolve_key(&payload.key) {
                        Ok(host) => host,
                        Err(err) => {
                            debug!("join rejected: {err:#}");
                            let ack = AckPayload::error(&err);
                            write_frame(io.get_mut(), ControlFrame::ack(ack, request_id)).await?;
                            return Ok(());
                        }
                    };
                    // The ack goes out before the socket enters the idle
                    // set, so it cannot be reordered behind a STREAM.
                    write_frame(io.get_mut(), ControlFrame::ack(AckPayload::empty(), request_id))
                        .await?;
                    return self.park_exposer(io, host, id).await;
                }
                ControlFrame::Stream { .. } | ControlFrame::Ack { .. } => {
                    return Err(e!(
                        RelayError::InvalidProtocol,
                        anyerr!("unexpected control frame from exposer")
                    ));
                }
            }
        }
    }

    /// Reads one control line. `Ok(None)` means the peer closed cleanly
    /// between frames.
    async fn read_control_frame(
        &self,
        io: &mut Prebuffered<BoxedIo>,
    ) -> Result<Option<ControlFrame>, RelayError> {
        let read = async {
            loop {
                if let Some(end) = protocol::find_line_end(io.buffer()) {
                    let frame = ControlFrame::parse(&io.buffer()[..end - 2])
                        .map_err(|err| e!(RelayError::InvalidProtocol, err.into()))?;
                    io.discard(end);
                    return Ok(Some(frame));
                }
                if io.is_full() {
                    return Err(e!(
                        RelayError::InvalidProtocol,
                        anyerr!("control line too long")
                    ));
                }
                let n = io
                    .buffer_more()
                    .await
                    .map_err(|err| e!(RelayError::Io, err.into()))?;
                if n == 0 {
                    return if io.buffer().is_empty() {
                        Ok(None)
                    } else {
                        Err(e!(
                            RelayError::InvalidProtocol,
                            anyerr!("connection closed mid control line")
                        ))
                    };
                }
            }
        };
        tokio::time::timeout(self.opts.header_read_timeout, read)
            .await
            .map_err(|_| e!(RelayError::HeaderTimeout))?
    }

    /// Holds a joined exposer socket idle until the pairing engine hands it
    /// a client or the socket disconnects.
    async fn park_exposer(
        &self,
        io: Prebuffered<BoxedIo>,
        host: String,
        id: u64,
    ) -> Result<(), RelayError> {
        let (residual, mut io) = io.into_parts();
        if !residual.is_empty() {
            return Err(e!(
                RelayError::InvalidProtocol,
                anyerr!("unexpected bytes from idle exposer")
            ));
        }
        let (handoff, mut rx) = oneshot::channel();
        if !self.registry.add_exposer(&host, ExposerSlot { id, handoff }) {
            debug!(%host, "couloir disappeared before the exposer went idle");
            return Ok(());
        }
        // An idle exposer sends nothing; reading doubles as EOF detection.
        enum Idle {
            Handoff(Result<PendingClient, oneshot::error::RecvError>),
            Socket(std::io::Result<usize>),
        }
        let mut probe = [0u8; 1];
        let outcome = tokio::select! {
            biased;
            client = &mut rx => Idle::Handoff(client),
            res = io.read(&mut probe) => Idle::Socket(res),
        };
        match outcome {
            Idle::Handoff(Ok(client)) => {
                let res = self.splice_pair(io, client).await;
                self.registry.release_pair(&host);
                res
            }
            // Registry dropped the slot; nothing left to serve.
            Idle::Handoff(Err(_)) => Ok(()),
            Idle::Socket(res) => {
                match res {
                    Ok(0) => debug!(%host, "idle exposer disconnected"),
                    Ok(_) => warn!(%host, "idle exposer sent unexpected bytes"),
                    Err(err) => debug!(%host, "idle exposer read failed: {err:#}"),
                }
                // A pairing decision may have fired concurrently; give the
                // client back instead of dropping it on the floor.
                rx.close();
                match rx.try_recv() {
                    Ok(client) => self.registry.requeue_client(&host, client),
                    Err(_) => self.registry.remove_exposer(&host, id),
                }
                Ok(())
            }
        }
    }

    /// Binds one exposer socket to one client: announces `STREAM`, replays
    /// the buffered client preface, then splices both directions.
    async fn splice_pair(
        &self,
        mut exposer: BoxedIo,
        client: PendingClient,
    ) -> Result<(), RelayError> {
        let stream_id = self.stream_id.fetch_add(1, Ordering::SeqCst);
        write_frame(&mut exposer, ControlFrame::stream(stream_id)).await?;
        exposer
            .write_all(&client.preface)
            .await
            .map_err(|err| e!(RelayError::Io, err.into()))?;

        let (mut exposer_recv, mut exposer_send) = tokio::io::split(exposer);
        let (mut client_recv, mut client_send) = tokio::io::split(client.io);
        let (from_client, from_exposer) = forward_bidi(
            &mut client_recv,
            &mut client_send,
            &mut exposer_recv,
            &mut exposer_send,
        )
        .await
        .map_err(|err| e!(RelayError::Io, err))?;
        debug!(from_client, from_exposer, "pair finished");
        Ok(())
    }

    /// Serves a socket classified as an HTTP client: extracts the `Host`
    /// header from the buffered head and routes the socket to its couloir.
    async fn serve_client(
        &self,
        mut io: Prebuffered<BoxedIo>,
        id: u64,
    ) -> Result<(), RelayError> {
        let head = match tokio::time::timeout(
            self.opts.header_read_timeout,
            HttpHead::peek(&mut io),
        )
        .await
        {
            Err(_) => {
                send_error_response(io.get_mut(), StatusCode::REQUEST_TIMEOUT)
                    .await
                    .ok();
                return Err(e!(RelayError::HeaderTimeout));
            }
            Ok(Err(err)) => {
                send_error_response(io.get_mut(), StatusCode::BAD_REQUEST)
                    .await
                    .ok();
                return Err(e!(RelayError::InvalidProtocol, err));
            }
            Ok(Ok((_header_len, head))) => head,
        };

        let Some(host) = head.host().map(str::to_string) else {
            send_error_response(io.get_mut(), StatusCode::BAD_REQUEST)
                .await
                .ok();
            return Err(e!(
                RelayError::InvalidProtocol,
                anyerr!("request without Host header")
            ));
        };
        debug!(%host, method = %head.method, target = %head.target, "client request");

        if host == self.opts.domain {
            let page = pages::relay_home(&self.opts.domain);
            HttpResponse::html(StatusCode::OK, page)
                .write(io.get_mut())
                .await
                .map_err(|err| e!(RelayError::Io, err.into()))?;
            return Ok(());
        }

        let (preface, io) = io.into_parts();
        let client = PendingClient { id, preface, io };
        if let Err(client) = self.registry.route_client(&host, client) {
            debug!(%host, "no couloir for host");
            let mut io = client.io;
            HttpResponse::html(StatusCode::NOT_FOUND, pages::not_found(&host))
                .write(&mut io)
                .await
                .ok();
        }
        // On success the socket now lives in the couloir's pending queue;
        // the exposer task that picks it up finishes the exchange.
        Ok(())
    }

    /// Starts certificate acquisition for a freshly opened couloir host
    /// (TLS mode only). Cancelled by relay shutdown.
    fn spawn_cert_warm(&self, host: String) {
        let Some(cert) = self.cert.clone() else {
            return;
        };
        let token = self.shutdown.child_token();
        self.tasks.spawn(token.run_until_cancelled_owned(async move {
            if let Err(err) = cert.ensure(&host).await {
                warn!(%host, "certificate acquisition failed: {err:#}");
            }
        }));
    }
}

async fn write_frame(
    io: &mut (impl AsyncWrite + Send + Unpin),
    frame: ControlFrame,
) -> Result<(), RelayError> {
    let line = frame.encode().map_err(|err| e!(RelayError::Io, err))?;
    io.write_all(line.as_bytes())
        .await
        .map_err(|err| e!(RelayError::Io, err.into()))?;
    io.flush()
        .await
        .map_err(|err| e!(RelayError::Io, err.into()))?;
    Ok(())
}

async fn send_error_response(
    io: &mut (impl AsyncWrite + Send + Unpin),
    status: StatusCode,
) -> std::io::Result<()> {
    let content = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    HttpResponse::text(status, content).write(io).await
}

mod pages {
    //! The two HTML pages the relay serves itself.

    pub(super) fn relay_home(domain: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head><title>couloir relay</title></head>\n<body>\n\
             <h1>This host is a couloir relay</h1>\n\
             <p>To open a new couloir under <code>*.{domain}</code>, run on the machine\n\
             with the server you want to expose:</p>\n\
             <pre>couloir expose 3000 --on {domain}</pre>\n\
             <p>Your server then becomes reachable at a <code>{domain}</code> subdomain.</p>\n\
             </body>\n</html>\n"
        )
    }

    pub(super) fn not_found(host: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head><title>404 Not Found</title></head>\n<body>\n\
             <h1>404 Not Found</h1>\n\
             <p>No couloir is currently open for <code>{host}</code>.</p>\n\
             </body>\n</html>\n"
        )
    }
}
