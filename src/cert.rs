//! On-demand certificates for couloir hostnames.
//!
//! [`CertService`] keeps one certificate per hostname, cached in memory and
//! on disk, and orders missing ones through an [`OrderCerts`] implementation
//! (ACME against Let's Encrypt in production, see [`acme`]). The TLS
//! listener resolves certificates synchronously during the handshake via
//! [`SniResolver`]; HTTP-01 challenges are answered by a plain listener on
//! port 80 fed from the shared [`ChallengeSet`].

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use http::StatusCode;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use rustls::{
    pki_types::CertificateDer,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{Mutex as AsyncMutex, watch},
};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    PREFACE_MAX_LENGTH,
    parse::{HttpHead, HttpResponse},
    util::Prebuffered,
};

pub mod acme;

/// How long an issued certificate is trusted before being reordered.
///
/// Let's Encrypt certificates live 90 days; reordering after 60 leaves a
/// renewal window without parsing notAfter out of the chain.
const CERT_VALIDITY: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// A freshly issued key/chain pair, both PEM-encoded.
pub struct IssuedCert {
    pub key_pem: String,
    pub chain_pem: String,
}

/// The opaque "fetch a certificate for this hostname" capability.
///
/// Implementations publish their HTTP-01 tokens through the given
/// [`ChallengeSet`] for the duration of the order.
pub trait OrderCerts: Send + Sync {
    fn order<'a>(
        &'a self,
        host: &'a str,
        challenges: &'a ChallengeSet,
    ) -> Pin<Box<dyn Future<Output = Result<IssuedCert>> + Send + 'a>>;
}

/// Pending HTTP-01 tokens, shared between in-flight orders and the port-80
/// challenge listener.
#[derive(Default, Clone)]
pub struct ChallengeSet {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeSet {
    pub fn publish(&self, token: String, key_authorization: String) {
        self.inner.write().unwrap().insert(token, key_authorization);
    }

    pub fn withdraw(&self, token: &str) {
        self.inner.write().unwrap().remove(token);
    }

    fn answer(&self, token: &str) -> Option<String> {
        self.inner.read().unwrap().get(token).cloned()
    }
}

/// Issuance time marker stored next to each certificate pair.
///
/// Written last: until `meta.json` exists the pair does not count as
/// present, which keeps the on-disk state all-or-nothing.
#[derive(Serialize, Deserialize)]
struct CertMeta {
    issued_at: u64,
}

/// Per-hostname certificate cache with coalesced ordering.
pub struct CertService {
    dir: PathBuf,
    orderer: Box<dyn OrderCerts>,
    challenges: ChallengeSet,
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    inflight: AsyncMutex<HashMap<String, watch::Receiver<bool>>>,
}

impl CertService {
    pub fn new(dir: PathBuf, orderer: Box<dyn OrderCerts>) -> Arc<Self> {
        Arc::new(Self {
            dir,
            orderer,
            challenges: ChallengeSet::default(),
            cache: RwLock::new(HashMap::new()),
            inflight: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Returns a certificate for `host`, ordering one if neither the memory
    /// cache nor the disk cache has it.
    ///
    /// Concurrent calls for the same hostname coalesce onto a single order;
    /// every caller observes the same resulting certificate.
    pub async fn ensure(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(key) = self.cached(host) {
            return Ok(key);
        }
        if let Some(key) = self.load_from_disk(host).await {
            self.cache.write().unwrap().insert(host.to_string(), key.clone());
            return Ok(key);
        }

        enum Role {
            Owner(watch::Sender<bool>),
            Waiter(watch::Receiver<bool>),
        }
        let role = {
            let mut inflight = self.inflight.lock().await;
            // The order may have completed while we waited for the lock.
            if let Some(key) = self.cached(host) {
                return Ok(key);
            }
            match inflight.get(host) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    inflight.insert(host.to_string(), rx);
                    Role::Owner(tx)
                }
            }
        };
        match role {
            Role::Waiter(mut rx) => {
                rx.wait_for(|done| *done)
                    .await
                    .std_context("in-flight certificate order vanished")?;
                self.cached(host)
                    .ok_or_else(|| anyerr!("certificate order for {host} failed"))
            }
            Role::Owner(done) => {
                let res = self.order_and_store(host).await;
                self.inflight.lock().await.remove(host);
                done.send(true).ok();
                res
            }
        }
    }

    /// Spawns [`CertService::ensure`] in the background, used to warm the
    /// relay domain and default couloir name at startup.
    pub fn spawn_ensure(self: &Arc<Self>, host: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.ensure(&host).await {
                warn!(%host, "certificate acquisition failed: {err:#}");
            }
        });
    }

    /// Builds the relay's TLS server configuration around [`SniResolver`].
    pub fn server_config(self: &Arc<Self>) -> rustls::ServerConfig {
        let resolver = SniResolver {
            service: self.clone(),
        };
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        // The splice does not understand HTTP/2 framing, so the handshake
        // must not negotiate it.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }

    /// Serves ACME HTTP-01 challenges on a plain listener; everything but
    /// the challenge path gets a 404.
    pub async fn serve_http01(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut conn_id = 0u64;
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            conn_id += 1;
            let this = self.clone();
            tokio::spawn(
                async move {
                    debug!(%peer_addr, "challenge connection");
                    if let Err(err) = this.answer_challenge(stream).await {
                        debug!("challenge connection failed: {err:#}");
                    }
                }
                .instrument(error_span!("acme-http", id = conn_id)),
            );
        }
    }

    async fn answer_challenge(&self, stream: TcpStream) -> Result<()> {
        const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
        let mut io = Prebuffered::new(stream, PREFACE_MAX_LENGTH);
        let (_, head) = HttpHead::peek(&mut io).await?;
        let answer = (head.method == http::Method::GET)
            .then(|| head.target.strip_prefix(CHALLENGE_PREFIX))
            .flatten()
            .and_then(|token| self.challenges.answer(token));
        let response = match answer {
            Some(key_authorization) => {
                debug!(target = %head.target, "answering HTTP-01 challenge");
                HttpResponse::text(StatusCode::OK, key_authorization)
            }
            None => HttpResponse::text(StatusCode::NOT_FOUND, "404 Not Found"),
        };
        response.write(io.get_mut()).await.anyerr()?;
        Ok(())
    }

    pub(crate) fn cached(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.cache.read().unwrap().get(host).cloned()
    }

    async fn order_and_store(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        debug!(%host, "ordering certificate");
        let issued = self
            .orderer
            .order(host, &self.challenges)
            .await
            .context("certificate order failed")?;
        let key = load_certified_key(issued.key_pem.as_bytes(), issued.chain_pem.as_bytes())?;
        self.persist(host, &issued).await?;
        self.cache.write().unwrap().insert(host.to_string(), key.clone());
        debug!(%host, "certificate stored");
        Ok(key)
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.dir.join(host)
    }

    /// Loads a still-valid certificate pair from disk, if present.
    async fn load_from_disk(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let dir = self.host_dir(host);
        let meta = tokio::fs::read(dir.join("meta.json")).await.ok()?;
        let meta: CertMeta = serde_json::from_slice(&meta).ok()?;
        if unix_now().saturating_sub(meta.issued_at) > CERT_VALIDITY.as_secs() {
            debug!(%host, "certificate on disk expired");
            return None;
        }
        let key_pem = tokio::fs::read(dir.join("key.pem")).await.ok()?;
        let chain_pem = tokio::fs::read(dir.join("cert.pem")).await.ok()?;
        match load_certified_key(&key_pem, &chain_pem) {
            Ok(key) => {
                debug!(%host, "certificate loaded from disk");
                Some(key)
            }
            Err(err) => {
                warn!(%host, "ignoring unreadable certificate on disk: {err:#}");
                None
            }
        }
    }

    async fn persist(&self, host: &str, issued: &IssuedCert) -> Result<()> {
        let dir = self.host_dir(host);
        tokio::fs::create_dir_all(&dir)
            .await
            .std_context("failed to create certificate directory")?;
        write_atomic(dir.join("key.pem"), issued.key_pem.as_bytes()).await?;
        write_atomic(dir.join("cert.pem"), issued.chain_pem.as_bytes()).await?;
        let meta = serde_json::to_vec(&CertMeta {
            issued_at: unix_now(),
        })
        .anyerr()?;
        write_atomic(dir.join("meta.json"), &meta).await?;
        Ok(())
    }
}

/// Certificate resolver on the TLS handshake path.
///
/// Resolution is synchronous, so only the memory cache is consulted. On a
/// miss the order starts in the background and this handshake fails; the
/// relay warms the main domain and first couloir name at startup to make
/// cold misses rare.
struct SniResolver {
    service: Arc<CertService>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?.to_string();
        if let Some(key) = self.service.cached(&host) {
            return Some(key);
        }
        debug!(%host, "no certificate for SNI name, ordering in background");
        let service = self.service.clone();
        tokio::spawn(async move {
            if let Err(err) = service.ensure(&host).await {
                warn!(%host, "certificate acquisition failed: {err:#}");
            }
        });
        None
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

/// Parses a PEM key/chain pair into a rustls [`CertifiedKey`].
fn load_certified_key(key_pem: &[u8], chain_pem: &[u8]) -> Result<Arc<CertifiedKey>> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &chain_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .std_context("failed to parse certificate PEM")?;
    ensure_any!(!chain.is_empty(), "no certificates found in PEM");
    let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
        .std_context("failed to parse private key PEM")?
        .context("no private key found in PEM")?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .std_context("unsupported private key type")?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Stages the bytes in a sibling temp file, fsyncs, then renames, so readers
/// observe either the old content or the new, never a torn write.
async fn write_atomic(path: PathBuf, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .std_context("failed to create staging file")?;
    file.write_all(bytes)
        .await
        .std_context("failed to write staging file")?;
    file.sync_all()
        .await
        .std_context("failed to sync staging file")?;
    drop(file);
    tokio::fs::rename(&tmp, &path)
        .await
        .std_context("failed to move staging file into place")?;
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Issues self-signed certificates and counts how many orders ran.
    struct CountingOrderer {
        orders: Arc<AtomicUsize>,
    }

    impl OrderCerts for CountingOrderer {
        fn order<'a>(
            &'a self,
            host: &'a str,
            _challenges: &'a ChallengeSet,
        ) -> Pin<Box<dyn Future<Output = Result<IssuedCert>> + Send + 'a>> {
            Box::pin(async move {
                self.orders.fetch_add(1, Ordering::SeqCst);
                // Give concurrent ensure() calls time to pile up.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let cert = rcgen::generate_simple_self_signed(vec![host.to_string()])
                    .std_context("failed to self-sign")?;
                Ok(IssuedCert {
                    key_pem: cert.key_pair.serialize_pem(),
                    chain_pem: cert.cert.pem(),
                })
            })
        }
    }

    fn service(dir: &tempfile::TempDir) -> (Arc<CertService>, Arc<AtomicUsize>) {
        let orders = Arc::new(AtomicUsize::new(0));
        let orderer = CountingOrderer {
            orders: orders.clone(),
        };
        let service = CertService::new(dir.path().to_path_buf(), Box::new(orderer));
        (service, orders)
    }

    #[tokio::test]
    async fn concurrent_ensure_coalesces_to_one_order() {
        let dir = tempfile::tempdir().unwrap();
        let (service, orders) = service(&dir);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.ensure("couloir.my.test").await
            }));
        }
        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(orders.load(Ordering::SeqCst), 1);
        // Every caller observes the very same certificate.
        assert!(keys.iter().all(|key| Arc::ptr_eq(key, &keys[0])));
    }

    #[tokio::test]
    async fn disk_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (service, orders) = service(&dir);
            service.ensure("couloir.my.test").await.unwrap();
            assert_eq!(orders.load(Ordering::SeqCst), 1);
        }
        let host_dir = dir.path().join("couloir.my.test");
        assert!(host_dir.join("cert.pem").exists());
        assert!(host_dir.join("key.pem").exists());
        assert!(host_dir.join("meta.json").exists());

        // A fresh service over the same directory loads without ordering.
        let (service, orders) = service(&dir);
        service.ensure("couloir.my.test").await.unwrap();
        assert_eq!(orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_meta_triggers_reorder() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (service, _) = service(&dir);
            service.ensure("couloir.my.test").await.unwrap();
        }
        // Age the pair far past the validity window.
        let meta_path = dir.path().join("couloir.my.test").join("meta.json");
        std::fs::write(&meta_path, serde_json::to_vec(&CertMeta { issued_at: 1 }).unwrap())
            .unwrap();

        let (service, orders) = service(&dir);
        service.ensure("couloir.my.test").await.unwrap();
        assert_eq!(orders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn challenge_set_publish_withdraw() {
        let challenges = ChallengeSet::default();
        challenges.publish("token".into(), "token.thumbprint".into());
        assert_eq!(challenges.answer("token").as_deref(), Some("token.thumbprint"));
        challenges.withdraw("token");
        assert_eq!(challenges.answer("token"), None);
    }
}
