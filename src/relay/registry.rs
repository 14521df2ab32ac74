//! Process-wide couloir registry: hostname allocation, key resolution, and
//! the pairing of waiting clients with idle exposer sockets.
//!
//! All cross-socket state lives behind one mutex and every mutation runs as
//! a single locked operation, so no two pairing decisions can race. The
//! actual byte splicing happens outside the lock, in the exposer task that
//! receives the client through its handoff channel.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Instant,
};

use bytes::Bytes;
use n0_error::stack_error;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::util::BoxedIo;

/// Couloir keys are 24 random bytes, handed out hex-encoded.
const KEY_LEN: usize = 24;

/// A classified client socket waiting for an exposer.
///
/// `preface` holds every byte read from the socket so far; it is replayed
/// into the exposer socket before the remaining stream is spliced.
pub(crate) struct PendingClient {
    pub id: u64,
    pub preface: Bytes,
    pub io: BoxedIo,
}

impl std::fmt::Debug for PendingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingClient")
            .field("id", &self.id)
            .field("preface", &self.preface)
            .finish_non_exhaustive()
    }
}

/// An idle exposer socket, represented by the channel through which its
/// parked task accepts exactly one client. Slots are single-use: once a
/// client is handed over, the socket never returns to the idle set.
pub(crate) struct ExposerSlot {
    pub id: u64,
    pub handoff: oneshot::Sender<PendingClient>,
}

struct Couloir {
    key: String,
    exposers: VecDeque<ExposerSlot>,
    pending: VecDeque<PendingClient>,
    active_pairs: usize,
    created_at: Instant,
}

#[derive(Default)]
struct State {
    by_host: HashMap<String, Couloir>,
    by_key: HashMap<String, String>,
    /// Default-name counter; monotonic for the process lifetime, never reused.
    counter: u64,
}

/// Rejections of an `OPEN_COULOIR` request, reported verbatim to the peer.
#[stack_error(derive)]
pub enum OpenError {
    #[error("Couloir host {host} is already opened")]
    HostTaken { host: String },
    #[error("Invalid couloir host {host}")]
    InvalidHost { host: String },
    #[error("Invalid password")]
    AuthFailed,
}

/// Rejection of a `JOIN_COULOIR` request, reported verbatim to the peer.
#[stack_error(derive)]
pub enum JoinError {
    #[error("Invalid couloir key. Please restart your couloir client.")]
    UnknownKey,
}

/// The process-wide couloir map.
pub(crate) struct Registry {
    domain: String,
    password: Option<String>,
    state: Mutex<State>,
}

impl Registry {
    pub fn new(domain: String, password: Option<String>) -> Self {
        Self {
            domain,
            password,
            state: Mutex::new(State::default()),
        }
    }

    /// Handles `OPEN_COULOIR`: validates the password and requested name,
    /// allocates a default name when necessary, and registers the couloir.
    ///
    /// Returns the assigned hostname and the fresh couloir key.
    pub fn open(
        &self,
        requested: Option<&str>,
        password: Option<&str>,
    ) -> Result<(String, String), OpenError> {
        if !self.password_ok(password) {
            return Err(OpenError::AuthFailed);
        }
        let mut state = self.state.lock().unwrap();
        let host = match requested.and_then(|host| self.strip_domain(host)) {
            Some((host, label)) => {
                if label.is_empty() || !label.bytes().all(is_host_label_byte) {
                    return Err(OpenError::InvalidHost { host: host.into() });
                }
                if state.by_host.contains_key(host) {
                    return Err(OpenError::HostTaken { host: host.into() });
                }
                host.to_string()
            }
            // Absent or foreign hostname: allocate the next default name.
            // The counter only moves forward, so closed couloirs never get
            // their default names handed out again.
            None => loop {
                state.counter += 1;
                let host = if state.counter == 1 {
                    format!("couloir.{}", self.domain)
                } else {
                    format!("couloir{}.{}", state.counter, self.domain)
                };
                if !state.by_host.contains_key(&host) {
                    break host;
                }
            },
        };

        let mut key_bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key_bytes);
        let key = hex::encode(key_bytes);

        state.by_key.insert(key.clone(), host.clone());
        state.by_host.insert(
            host.clone(),
            Couloir {
                key: key.clone(),
                exposers: VecDeque::new(),
                pending: VecDeque::new(),
                active_pairs: 0,
                created_at: Instant::now(),
            },
        );
        debug!(host, "couloir opened");
        Ok((host, key))
    }

    /// Resolves a `JOIN_COULOIR` key to its couloir hostname.
    pub fn resolve_key(&self, key: &str) -> Result<String, JoinError> {
        let state = self.state.lock().unwrap();
        state
            .by_key
            .get(key)
            .cloned()
            .ok_or(JoinError::UnknownKey)
    }

    /// Inserts an idle exposer socket and pairs it against any waiting
    /// clients. Returns `false` when the couloir no longer exists, in which
    /// case the caller closes the socket.
    pub fn add_exposer(&self, host: &str, slot: ExposerSlot) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(couloir) = state.by_host.get_mut(host) else {
            return false;
        };
        trace!(host, id = slot.id, "exposer idle");
        couloir.exposers.push_back(slot);
        Self::pair(host, couloir);
        true
    }

    /// Enqueues a client whose preface has been parsed and pairs it against
    /// any idle exposer. The client socket is returned when no couloir is
    /// registered for `host`, so the caller can answer `404 Not Found`.
    pub fn route_client(&self, host: &str, client: PendingClient) -> Result<(), PendingClient> {
        let mut state = self.state.lock().unwrap();
        let Some(couloir) = state.by_host.get_mut(host) else {
            return Err(client);
        };
        trace!(host, id = client.id, "client waiting");
        couloir.pending.push_back(client);
        Self::pair(host, couloir);
        Ok(())
    }

    /// Evicts an idle exposer after its socket disconnected, then checks the
    /// couloir for teardown.
    pub fn remove_exposer(&self, host: &str, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(couloir) = state.by_host.get_mut(host) {
            couloir.exposers.retain(|slot| slot.id != id);
        }
        Self::teardown(&mut state, host);
    }

    /// Marks a bound pair as finished, then checks the couloir for teardown.
    pub fn release_pair(&self, host: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(couloir) = state.by_host.get_mut(host) {
            couloir.active_pairs = couloir.active_pairs.saturating_sub(1);
        }
        Self::teardown(&mut state, host);
    }

    /// Returns a client whose exposer handoff lost the race with the exposer
    /// socket disconnecting. The client goes back to the front of the queue
    /// and pairing re-runs against the remaining idle exposers.
    pub fn requeue_client(&self, host: &str, client: PendingClient) {
        let mut state = self.state.lock().unwrap();
        let Some(couloir) = state.by_host.get_mut(host) else {
            // Couloir torn down in the meantime; dropping the socket closes it.
            return;
        };
        couloir.active_pairs = couloir.active_pairs.saturating_sub(1);
        couloir.pending.push_front(client);
        Self::pair(host, couloir);
    }

    /// Deletes the couloir if it has no idle exposers, no pending clients
    /// and no bound pairs. Called after every exposer disconnect and pair
    /// release, and when a control socket closes after `OPEN_COULOIR`
    /// without ever joining.
    pub fn teardown_check(&self, host: &str) {
        let mut state = self.state.lock().unwrap();
        Self::teardown(&mut state, host);
    }

    pub fn contains(&self, host: &str) -> bool {
        self.state.lock().unwrap().by_host.contains_key(host)
    }

    /// Pairs one idle exposer with one waiting client, FIFO on both sides,
    /// until either queue is empty. Runs with the registry lock held; the
    /// receiving exposer task does the splicing outside the lock.
    fn pair(host: &str, couloir: &mut Couloir) {
        while !couloir.exposers.is_empty() && !couloir.pending.is_empty() {
            let Some(slot) = couloir.exposers.pop_front() else {
                break;
            };
            let Some(client) = couloir.pending.pop_front() else {
                break;
            };
            let client_id = client.id;
            match slot.handoff.send(client) {
                Ok(()) => {
                    couloir.active_pairs += 1;
                    trace!(host, exposer = slot.id, client = client_id, "paired");
                }
                Err(client) => {
                    // The exposer task went away before taking the client.
                    trace!(host, exposer = slot.id, "exposer gone, retrying");
                    couloir.pending.push_front(client);
                }
            }
        }
    }

    fn teardown(state: &mut State, host: &str) {
        let empty = state.by_host.get(host).is_some_and(|couloir| {
            couloir.exposers.is_empty() && couloir.pending.is_empty() && couloir.active_pairs == 0
        });
        if empty {
            if let Some(couloir) = state.by_host.remove(host) {
                state.by_key.remove(&couloir.key);
                debug!(host, lived = ?couloir.created_at.elapsed(), "couloir removed");
            }
        }
    }

    fn password_ok(&self, provided: Option<&str>) -> bool {
        match (&self.password, provided) {
            (None, _) => true,
            (Some(want), Some(got)) => bool::from(want.as_bytes().ct_eq(got.as_bytes())),
            (Some(_), None) => false,
        }
    }

    /// Splits `host` into the full host and its subdomain label when it is
    /// directly under the relay domain; `None` sends the caller down the
    /// default-name path.
    fn strip_domain<'a>(&self, host: &'a str) -> Option<(&'a str, &'a str)> {
        let label = host.strip_suffix(&self.domain)?;
        let label = label.strip_suffix('.')?;
        Some((host, label))
    }
}

fn is_host_label_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new("my.test".into(), None)
    }

    fn client(id: u64) -> PendingClient {
        let (a, _b) = tokio::io::duplex(64);
        PendingClient {
            id,
            preface: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
            io: Box::new(a),
        }
    }

    fn slot(id: u64) -> (ExposerSlot, oneshot::Receiver<PendingClient>) {
        let (tx, rx) = oneshot::channel();
        (ExposerSlot { id, handoff: tx }, rx)
    }

    #[test]
    fn default_names_are_monotonic() {
        let reg = registry();
        let (host1, key1) = reg.open(None, None).unwrap();
        let (host2, key2) = reg.open(None, None).unwrap();
        assert_eq!(host1, "couloir.my.test");
        assert_eq!(host2, "couloir2.my.test");
        assert_eq!(key1.len(), 48);
        assert_eq!(key2.len(), 48);
        assert_ne!(key1, key2);
    }

    #[test]
    fn default_names_skip_claimed_hosts() {
        let reg = registry();
        reg.open(Some("couloir2.my.test"), None).unwrap();
        let (host1, _) = reg.open(None, None).unwrap();
        let (host2, _) = reg.open(None, None).unwrap();
        assert_eq!(host1, "couloir.my.test");
        assert_eq!(host2, "couloir3.my.test");
    }

    #[test]
    fn foreign_domain_falls_back_to_default_name() {
        let reg = registry();
        let (host, _) = reg.open(Some("x.other.test"), None).unwrap();
        assert_eq!(host, "couloir.my.test");
    }

    #[test]
    fn explicit_host_collision_rejected() {
        let reg = registry();
        reg.open(Some("x.my.test"), None).unwrap();
        let err = reg.open(Some("x.my.test"), None).unwrap_err();
        assert_eq!(err.to_string(), "Couloir host x.my.test is already opened");
    }

    #[test]
    fn invalid_label_rejected() {
        let reg = registry();
        assert!(reg.open(Some("UPPER.my.test"), None).is_err());
        assert!(reg.open(Some("a_b.my.test"), None).is_err());
        assert!(reg.open(Some(".my.test"), None).is_err());
        // A nested label contains a dot, which the charset excludes.
        assert!(reg.open(Some("a.b.my.test"), None).is_err());
    }

    #[test]
    fn password_checked_on_open() {
        let reg = Registry::new("my.test".into(), Some("sesame".into()));
        assert!(matches!(
            reg.open(None, None),
            Err(OpenError::AuthFailed { .. })
        ));
        assert!(matches!(
            reg.open(None, Some("wrong")),
            Err(OpenError::AuthFailed { .. })
        ));
        assert!(reg.open(None, Some("sesame")).is_ok());
    }

    #[test]
    fn key_bijection_while_couloir_lives() {
        let reg = registry();
        let (host, key) = reg.open(None, None).unwrap();
        assert_eq!(reg.resolve_key(&key).unwrap(), host);

        let (slot1, _rx) = slot(1);
        assert!(reg.add_exposer(&host, slot1));
        reg.remove_exposer(&host, 1);
        assert!(!reg.contains(&host));
        assert!(reg.resolve_key(&key).is_err());
    }

    #[test]
    fn pairing_is_fifo_and_conserving() {
        let reg = registry();
        let (host, _key) = reg.open(None, None).unwrap();

        let (slot1, mut rx1) = slot(1);
        let (slot2, mut rx2) = slot(2);
        reg.add_exposer(&host, slot1);
        reg.add_exposer(&host, slot2);

        reg.route_client(&host, client(10)).unwrap();
        reg.route_client(&host, client(11)).unwrap();
        reg.route_client(&host, client(12)).unwrap();

        // Two pairs formed, FIFO on both sides; the third client waits.
        assert_eq!(rx1.try_recv().unwrap().id, 10);
        assert_eq!(rx2.try_recv().unwrap().id, 11);

        // A third exposer picks up the waiting client.
        let (slot3, mut rx3) = slot(3);
        reg.add_exposer(&host, slot3);
        assert_eq!(rx3.try_recv().unwrap().id, 12);
    }

    #[test]
    fn dead_exposer_slot_is_skipped() {
        let reg = registry();
        let (host, _key) = reg.open(None, None).unwrap();

        let (dead, rx_dead) = slot(1);
        drop(rx_dead);
        let (live, mut rx_live) = slot(2);
        reg.add_exposer(&host, dead);
        reg.add_exposer(&host, live);

        reg.route_client(&host, client(10)).unwrap();
        assert_eq!(rx_live.try_recv().unwrap().id, 10);
    }

    #[test]
    fn unknown_host_returns_client() {
        let reg = registry();
        let back = reg.route_client("missing.my.test", client(1)).unwrap_err();
        assert_eq!(back.id, 1);
    }

    #[test]
    fn teardown_waits_for_bound_pairs() {
        let reg = registry();
        let (host, _key) = reg.open(None, None).unwrap();

        let (slot1, mut rx1) = slot(1);
        reg.add_exposer(&host, slot1);
        reg.route_client(&host, client(10)).unwrap();
        let _client = rx1.try_recv().unwrap();

        // Idle set is empty but one pair is still bound.
        reg.remove_exposer(&host, 1);
        assert!(reg.contains(&host));

        reg.release_pair(&host);
        assert!(!reg.contains(&host));
    }

    #[test]
    fn requeue_after_lost_handoff() {
        let reg = registry();
        let (host, _key) = reg.open(None, None).unwrap();

        let (slot1, mut rx1) = slot(1);
        reg.add_exposer(&host, slot1);
        reg.route_client(&host, client(10)).unwrap();
        let raced = rx1.try_recv().unwrap();

        // The exposer task noticed its socket died after the handoff fired
        // and gives the client back; a fresh exposer picks it up.
        reg.remove_exposer(&host, 1);
        reg.requeue_client(&host, raced);
        let (slot2, mut rx2) = slot(2);
        reg.add_exposer(&host, slot2);
        assert_eq!(rx2.try_recv().unwrap().id, 10);
    }

    #[test]
    fn unknown_key_rejected() {
        let reg = registry();
        let err = reg.resolve_key("deadbeef").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid couloir key. Please restart your couloir client."
        );
    }
}
