use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::message::{
    Fingerprint, Message, MessageKind, FINGERPRINT_SIZE, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE,
    WIRE_VERSION,
};
use crate::nat::{GatewayDiscovery, NatGateway};
use crate::util::net::{blast, resolve_udp_addr};

/// Generator for the fingerprints this peer stamps on its frames. See
///  [ServerConfig::fingerprint_check](crate::server::ServerConfig::fingerprint_check)
///  for how a custom generator pairs with a server-side filter.
pub type FingerprintFn = Arc<dyn Fn() -> anyhow::Result<Fingerprint> + Send + Sync>;

/// The handshake window closed without a single HelloPeer arriving. Construction
///  uses this to tell "nobody can reach us yet" (which arms the NAT gateway
///  fallback) apart from fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no messages from peers or server received")]
pub struct NoHelloReceived;

pub struct PeerConfig {
    /// Copies of each outbound rendezvous datagram, in case some are dropped.
    pub packet_blast_count: usize,

    /// How long to wait for the first HelloPeer before falling back to NAT gateway
    ///  port forwarding. `None` disables the fallback entirely.
    pub init_timeout_until_gateway: Option<Duration>,

    /// Lease for a port mapping created on a NAT gateway; the mapping is refreshed
    ///  every quarter lease while the peer is alive.
    pub gateway_port_map_timeout: Duration,

    /// Cadence of outbound ReadyToMingle heartbeats. `None` disables them.
    pub ready_to_mingle_interval: Option<Duration>,

    /// Local address to bind; the default takes any interface and a random port.
    pub listen_addr: String,

    /// Upper bound on the known-peer table. When full, the oldest-inserted entry is
    ///  evicted to make room.
    pub max_peers: usize,

    /// Fingerprint generator; 64 random bytes per hello cycle if unset.
    pub fingerprint_fn: Option<FingerprintFn>,

    /// How to find a NAT gateway if the fallback is needed. Leaving this unset makes
    ///  the fallback behave as if discovery failed.
    pub gateway_discovery: Option<Arc<dyn GatewayDiscovery>>,
}

impl PeerConfig {
    pub fn new() -> PeerConfig {
        PeerConfig {
            packet_blast_count: 3,
            init_timeout_until_gateway: Some(Duration::from_secs(1)),
            gateway_port_map_timeout: Duration::from_secs(60),
            ready_to_mingle_interval: Some(Duration::from_secs(60)),
            listen_addr: "0.0.0.0:0".to_string(),
            max_peers: 10,
            fingerprint_fn: None,
            gateway_discovery: None,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig::new()
    }
}

struct PeerState {
    fingerprint: Fingerprint,
    /// Most recently resolved server address. Frames from this address are never
    ///  recorded as peers. A server behind multiple DNS records may be misidentified
    ///  here; that is a known limitation.
    last_server_addr: Option<SocketAddr>,
    /// Our externally observed address, from the first HelloPeer that reached us.
    remote_addr: Option<SocketAddr>,
    /// Known peers with their insertion rank, used for oldest-first eviction.
    peers: FxHashMap<SocketAddr, u64>,
    next_peer_seq: u64,
    closed: bool,
}

impl PeerState {
    /// Records `src` as a known peer. A full table evicts its oldest entry first; an
    ///  address already present keeps its original insertion rank.
    fn note_peer(&mut self, src: SocketAddr, max_peers: usize) {
        if self.peers.contains_key(&src) {
            return;
        }
        if self.peers.len() >= max_peers {
            let oldest = self
                .peers
                .iter()
                .min_by_key(|(_, seq)| **seq)
                .map(|(addr, _)| *addr);
            if let Some(oldest) = oldest {
                trace!(%oldest, "peer table full, evicting");
                self.peers.remove(&oldest);
            }
        }
        self.peers.insert(src, self.next_peer_seq);
        self.next_peer_seq += 1;
    }
}

struct PeerShared {
    socket: UdpSocket,
    server_addr_str: String,
    blast_count: usize,
    max_peers: usize,
    fingerprint_fn: Option<FingerprintFn>,
    state: RwLock<PeerState>,
}

/// A rendezvous peer: it discovers other peers through a bonfire server and then
///  shares its UDP socket between rendezvous traffic and the application's own
///  datagrams (see [read_from](Peer::read_from)).
///
/// Until [close](Peer::close) is called the peer keeps the socket open and, unless
///  disabled, periodically re-advertises itself as ready to mingle so the server can
///  introduce newcomers to it.
pub struct Peer {
    shared: Arc<PeerShared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").finish_non_exhaustive()
    }
}

impl Peer {
    /// Binds a socket and rendezvouses with the server at `server_addr`, blocking
    ///  until at least one peer (or the server itself) has said hello, or until the
    ///  NAT gateway fallback has run its course. Canceling `cancel` aborts
    ///  construction; after this returns, the peer lives until [close](Peer::close).
    ///
    /// Panics if `network` is anything other than `"udp"`.
    pub async fn new(
        cancel: CancellationToken,
        network: &str,
        server_addr: &str,
        config: PeerConfig,
    ) -> anyhow::Result<Peer> {
        assert_eq!(network, "udp", "only network 'udp' is supported by Peer::new");

        let socket = UdpSocket::bind(&config.listen_addr)
            .await
            .with_context(|| format!("binding {}", config.listen_addr))?;

        let shared = Arc::new(PeerShared {
            socket,
            server_addr_str: server_addr.to_string(),
            blast_count: config.packet_blast_count,
            max_peers: config.max_peers,
            fingerprint_fn: config.fingerprint_fn.clone(),
            state: RwLock::new(PeerState {
                fingerprint: Fingerprint([0; FINGERPRINT_SIZE]),
                last_server_addr: None,
                remote_addr: None,
                peers: FxHashMap::default(),
                next_peer_seq: 0,
                closed: false,
            }),
        });

        let mut gateway: Option<(Arc<dyn NatGateway>, u16)> = None;
        let meet_result = shared.meet(&cancel, config.init_timeout_until_gateway).await;
        let meet_result = match meet_result {
            Err(e)
                if config.init_timeout_until_gateway.is_some()
                    && e.downcast_ref::<NoHelloReceived>().is_some() =>
            {
                debug!("no hello received, falling back to NAT gateway port forwarding");
                let discovery = config
                    .gateway_discovery
                    .as_ref()
                    .ok_or(e)
                    .context("no NAT gateway discovery configured")?;
                let gw = discovery.discover().await.context("discovering NAT gateway")?;
                let port = shared.socket.local_addr()?.port();
                gw.add_port_mapping("udp", port, config.gateway_port_map_timeout)
                    .await
                    .context("adding NAT port mapping")?;
                gateway = Some((gw, port));

                // second try runs on the caller's context alone, no inner window
                shared.meet(&cancel, None).await
            }
            result => result,
        };
        meet_result?;

        // The server resolved and the socket sent just fine during the handshake, so
        //  a failure here is taken as temporary and left to the heartbeat to retry.
        if config.ready_to_mingle_interval.is_some() {
            if let Err(e) = shared.ready_to_mingle().await {
                debug!("initial ready-to-mingle failed: {}", e);
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        if let Some(period) = config.ready_to_mingle_interval {
            tasks.push(tokio::spawn(run_mingle_heartbeat(
                shared.clone(),
                period,
                shutdown_rx.clone(),
            )));
        }
        if let Some((gw, port)) = gateway {
            tasks.push(tokio::spawn(run_gateway_refresh(
                gw,
                port,
                config.gateway_port_map_timeout,
                shutdown_rx,
            )));
        }

        Ok(Peer {
            shared,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Reads one application datagram into `buf`, returning its length and sender.
    ///  Rendezvous frames addressed to this peer are consumed and handled along the
    ///  way; everything else - wrong size, wrong version, foreign fingerprint, or a
    ///  matching prefix that fails to parse - is handed to the caller verbatim.
    ///
    /// `buf` must hold at least [MAX_MESSAGE_SIZE] bytes.
    pub async fn read_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        if buf.len() < MAX_MESSAGE_SIZE {
            bail!(
                "buffer passed to read_from must hold at least {} bytes",
                MAX_MESSAGE_SIZE
            );
        }

        loop {
            let (n, src) = self.shared.socket.recv_from(buf).await?;
            if n > MAX_MESSAGE_SIZE || n < MIN_MESSAGE_SIZE || buf[0] != WIRE_VERSION {
                return Ok((n, src));
            }

            {
                let state = self.shared.state.read().await;
                if buf[1..1 + FINGERPRINT_SIZE] != state.fingerprint.0[..] {
                    return Ok((n, src));
                }
            }

            let msg = match Message::try_deser(&buf[..n]) {
                Ok(msg) => msg,
                // a matching prefix that fails to parse does not prove the datagram
                //  was ours, so it goes to the application rather than the floor
                Err(_) => return Ok((n, src)),
            };
            self.shared.process_rendezvous(src, msg).await;
        }
    }

    /// Passthrough to the underlying socket for application traffic.
    pub async fn write_to(&self, buf: &[u8], dst: SocketAddr) -> anyhow::Result<usize> {
        Ok(self.shared.socket.send_to(buf, dst).await?)
    }

    /// The addresses of all currently known peers, in no particular order.
    pub async fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.shared.state.read().await.peers.keys().copied().collect()
    }

    /// Our externally observed address, as reported by whoever said hello first.
    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.state.read().await.remote_addr
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Empties the known-peer table, rotates the fingerprint and hellos the server
    ///  again. Keep calling [read_from](Peer::read_from) afterwards so the resulting
    ///  hellos are collected.
    pub async fn reset_peers(&self) -> anyhow::Result<()> {
        self.shared.reset_peers().await
    }

    /// Stops the background tasks (removing the NAT mapping if one was installed)
    ///  and marks the peer closed. Closing a closed peer is an error.
    pub async fn close(&self) -> anyhow::Result<()> {
        {
            let mut state = self.shared.state.write().await;
            if state.closed {
                bail!("peer already closed");
            }
            state.closed = true;
        }

        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl PeerShared {
    /// One hello cycle: re-key, hello the server, then wait for the first HelloPeer.
    ///  A `window` of `None` waits until `cancel` fires.
    async fn meet(&self, cancel: &CancellationToken, window: Option<Duration>) -> anyhow::Result<()> {
        self.reset_peers().await?;

        let wait = async {
            match window {
                Some(window) => match timeout(window, self.wait_for_hello()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(NoHelloReceived)),
                },
                None => self.wait_for_hello().await,
            }
        };

        select! {
            _ = cancel.cancelled() => Err(anyhow!("canceled while waiting for a hello")),
            result = wait => result,
        }
    }

    /// Drains the socket until one valid HelloPeer has been processed. Anything
    ///  else, application traffic included, is dropped during this window.
    async fn wait_for_hello(&self) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let (n, src) = self.socket.recv_from(&mut buf).await?;
            let msg = match Message::try_deser(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    trace!(%src, "ignoring datagram while waiting for hello: {}", e);
                    continue;
                }
            };
            if !matches!(msg.kind, MessageKind::HelloPeer { .. }) {
                continue;
            }
            self.process_rendezvous(src, msg).await;
            return Ok(());
        }
    }

    /// Clears the peer table, rotates the fingerprint, re-resolves the server and
    ///  blasts it a HelloServer.
    async fn reset_peers(&self) -> anyhow::Result<()> {
        let fingerprint = match &self.fingerprint_fn {
            Some(f) => f()?,
            None => Fingerprint::random(),
        };
        let server_addr = resolve_udp_addr(&self.server_addr_str).await?;

        {
            let mut state = self.state.write().await;
            state.peers.clear();
            state.fingerprint = fingerprint;
            state.last_server_addr = Some(server_addr);
        }

        let hello = Message {
            fingerprint,
            kind: MessageKind::HelloServer,
        };
        blast(&self.socket, server_addr, self.blast_count, &hello).await
    }

    /// Advertises this peer as ready to mingle, re-resolving the server first.
    async fn ready_to_mingle(&self) -> anyhow::Result<()> {
        let server_addr = resolve_udp_addr(&self.server_addr_str).await?;
        let fingerprint = {
            let mut state = self.state.write().await;
            state.last_server_addr = Some(server_addr);
            state.fingerprint
        };

        let msg = Message {
            fingerprint,
            kind: MessageKind::ReadyToMingle,
        };
        blast(&self.socket, server_addr, self.blast_count, &msg).await
    }

    /// Handles one rendezvous frame. State changes are committed and the lock is
    ///  released before any datagram goes out.
    async fn process_rendezvous(&self, src: SocketAddr, msg: Message) {
        match msg.kind {
            MessageKind::Meet { addr, fingerprint } => {
                debug!(peer = %addr, "introduced, punching hole");
                // The outgoing hello opens our NAT for the newcomer's reply and
                //  carries the newcomer's own fingerprint so its mux recognizes it.
                let hello = Message {
                    fingerprint,
                    kind: MessageKind::HelloPeer { addr },
                };
                if let Err(e) = blast(&self.socket, addr, self.blast_count, &hello).await {
                    debug!(peer = %addr, "hole-punch hello failed: {}", e);
                }
            }
            MessageKind::HelloPeer { addr } => {
                let mut state = self.state.write().await;
                if state.remote_addr.is_none() {
                    debug!(%addr, "learned own external address");
                    state.remote_addr = Some(addr);
                }
                if state.last_server_addr == Some(src) {
                    return; // the server does not count as a peer
                }
                state.note_peer(src, self.max_peers);
            }
            MessageKind::HelloServer | MessageKind::ReadyToMingle => {
                trace!(%src, kind = %msg.kind, "ignoring server-bound message");
            }
        }
    }
}

/// Re-advertises readiness to mingle every `period`. The initial advertisement went
///  out during construction, so the first tick is one full period out.
async fn run_mingle_heartbeat(
    shared: Arc<PeerShared>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => {
                if let Err(e) = shared.ready_to_mingle().await {
                    warn!("ready-to-mingle heartbeat failed: {}", e);
                }
            }
        }
    }
}

/// Renews the NAT port mapping every quarter lease, and deletes it on shutdown.
async fn run_gateway_refresh(
    gateway: Arc<dyn NatGateway>,
    port: u16,
    lease: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = lease / 4;
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        select! {
            _ = shutdown_rx.changed() => {
                if let Err(e) = gateway.delete_port_mapping("udp", port).await {
                    warn!("removing NAT port mapping failed: {}", e);
                }
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = gateway.add_port_mapping("udp", port, lease).await {
                    warn!("refreshing NAT port mapping failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use crate::nat::{MockGatewayDiscovery, MockNatGateway};
    use crate::server::{Server, ServerConfig};

    use super::*;

    /// A scripted stand-in for the server: tests drive it by hand so the exact
    ///  frames a peer sees are deterministic.
    struct FakeServer {
        socket: UdpSocket,
    }

    impl FakeServer {
        async fn bind() -> FakeServer {
            FakeServer {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn addr_string(&self) -> String {
            self.socket.local_addr().unwrap().to_string()
        }

        /// Receives one HelloServer and echoes a HelloPeer back, the way a real
        ///  server treats a lone newcomer. Returns the peer's address and the
        ///  fingerprint it used.
        async fn answer_hello(&self) -> (SocketAddr, Fingerprint) {
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            let (n, src) = self.socket.recv_from(&mut buf).await.unwrap();
            let msg = Message::try_deser(&buf[..n]).unwrap();
            assert_eq!(msg.kind, MessageKind::HelloServer);

            let reply = Message {
                fingerprint: msg.fingerprint,
                kind: MessageKind::HelloPeer { addr: src },
            };
            let mut out = BytesMut::new();
            reply.ser(&mut out);
            self.socket.send_to(&out, src).await.unwrap();
            (src, msg.fingerprint)
        }
    }

    fn test_config() -> PeerConfig {
        PeerConfig {
            packet_blast_count: 1,
            init_timeout_until_gateway: None,
            ready_to_mingle_interval: None,
            listen_addr: "127.0.0.1:0".to_string(),
            ..PeerConfig::new()
        }
    }

    async fn send_hello_from(socket: &UdpSocket, dst: SocketAddr, fingerprint: Fingerprint) {
        let msg = Message {
            fingerprint,
            kind: MessageKind::HelloPeer { addr: dst },
        };
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        socket.send_to(&buf, dst).await.unwrap();
    }

    /// Lets the peer chew through everything queued on its socket; the read itself
    ///  is expected to time out since only rendezvous frames are pending.
    async fn drain(peer: &Peer) {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let result = timeout(Duration::from_millis(300), peer.read_from(&mut buf)).await;
        assert!(result.is_err(), "expected only rendezvous traffic while draining");
    }

    async fn fake_server_peer() -> (FakeServer, Peer, Fingerprint) {
        let fake = FakeServer::bind().await;
        let addr_string = fake.addr_string();
        let (peer, hello) = tokio::join!(
            Peer::new(CancellationToken::new(), "udp", &addr_string, test_config()),
            fake.answer_hello(),
        );
        (fake, peer.unwrap(), hello.1)
    }

    #[tokio::test]
    async fn test_server_peer_end_to_end() {
        const SERVER_ADDR: &str = "127.0.0.1:4499";
        let cancel = CancellationToken::new();
        let server = Server::new(ServerConfig::new());
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                server.listen(cancel, "udp", SERVER_ADDR).await.unwrap();
            });
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let peer_config = || PeerConfig {
            init_timeout_until_gateway: None,
            listen_addr: "127.0.0.1:0".to_string(),
            ..PeerConfig::new()
        };

        let peer_a = Peer::new(cancel.clone(), "udp", SERVER_ADDR, peer_config())
            .await
            .unwrap();
        assert_eq!(peer_a.remote_addr().await, Some(peer_a.local_addr().unwrap()));
        assert!(peer_a.peer_addrs().await.is_empty());

        // give the server a moment to process peer A's ReadyToMingle
        tokio::time::sleep(Duration::from_millis(500)).await;

        // multiplexing: raw bytes from an unrelated socket come out of read_from
        let app_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload: Vec<u8> = (0..100u8).collect();
        app_socket
            .send_to(&payload, peer_a.remote_addr().await.unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let (n, src) = peer_a.read_from(&mut buf).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..n], &payload[..]);
        assert_eq!(src, app_socket.local_addr().unwrap());

        // keep peer A draining so it answers the Meet introduction for peer B
        let peer_a = Arc::new(peer_a);
        let drain_a = {
            let peer_a = peer_a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_MESSAGE_SIZE];
                loop {
                    if peer_a.read_from(&mut buf).await.is_err() {
                        return;
                    }
                }
            })
        };

        let peer_b = Peer::new(cancel.clone(), "udp", SERVER_ADDR, peer_config())
            .await
            .unwrap();

        // the server's own hello is likely the first to arrive; drain for a moment
        // to collect peer A's hole-punch hellos as well
        drain(&peer_b).await;

        assert_eq!(peer_b.remote_addr().await, Some(peer_b.local_addr().unwrap()));
        assert_eq!(
            peer_b.peer_addrs().await,
            vec![peer_a.remote_addr().await.unwrap()]
        );

        drain_a.abort();

        // direct peer-to-peer application traffic over the rendezvous sockets
        let greeting = b"hi from b";
        peer_b
            .write_to(greeting, peer_b.peer_addrs().await[0])
            .await
            .unwrap();
        let (n, src) = peer_a.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], greeting);
        assert_eq!(src, peer_b.local_addr().unwrap());

        peer_b.close().await.unwrap();
        peer_a.close().await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_foreign_fingerprint_is_application_traffic() {
        let (fake, peer, _) = fake_server_peer().await;

        // valid size and version, but a fingerprint that is not the peer's
        let foreign = Message {
            fingerprint: Fingerprint::random(),
            kind: MessageKind::ReadyToMingle,
        };
        let mut out = BytesMut::new();
        foreign.ser(&mut out);
        fake.socket
            .send_to(&out, peer.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let (n, src) = peer.read_from(&mut buf).await.unwrap();
        assert_eq!(n, out.len());
        assert_eq!(&buf[..n], &out[..]);
        assert_eq!(src, fake.socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_undersized_read_buffer_is_rejected() {
        let (_fake, peer, _) = fake_server_peer().await;

        let mut buf = [0u8; MAX_MESSAGE_SIZE - 1];
        assert!(peer.read_from(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_table_is_bounded_and_deduplicated() {
        let fake = FakeServer::bind().await;
        let config = PeerConfig {
            max_peers: 3,
            ..test_config()
        };
        let addr_string = fake.addr_string();
        let (peer, hello) = tokio::join!(
            Peer::new(CancellationToken::new(), "udp", &addr_string, config),
            fake.answer_hello(),
        );
        let peer = peer.unwrap();
        let fingerprint = hello.1;
        let peer_addr = peer.local_addr().unwrap();

        // repeated hellos from one source leave a single entry
        let s1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..3 {
            send_hello_from(&s1, peer_addr, fingerprint).await;
        }
        drain(&peer).await;
        assert_eq!(peer.peer_addrs().await, vec![s1.local_addr().unwrap()]);

        // three more distinct sources overflow the table by one; the oldest entry
        // (s1) is the one evicted
        let mut late_sockets = Vec::new();
        for _ in 0..3 {
            let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            send_hello_from(&s, peer_addr, fingerprint).await;
            late_sockets.push(s);
        }
        drain(&peer).await;

        let addrs = peer.peer_addrs().await;
        assert_eq!(addrs.len(), 3);
        assert!(!addrs.contains(&s1.local_addr().unwrap()));
        for s in &late_sockets {
            assert!(addrs.contains(&s.local_addr().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_reset_peers_rotates_fingerprint_and_clears_table() {
        let (fake, peer, first_fingerprint) = fake_server_peer().await;
        let peer_addr = peer.local_addr().unwrap();

        let s1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send_hello_from(&s1, peer_addr, first_fingerprint).await;
        drain(&peer).await;
        assert_eq!(peer.peer_addrs().await.len(), 1);

        let (reset, hello) = tokio::join!(peer.reset_peers(), fake.answer_hello());
        reset.unwrap();
        assert_ne!(hello.1, first_fingerprint);
        assert!(peer.peer_addrs().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_an_error_the_second_time() {
        let (_fake, peer, _) = fake_server_peer().await;

        peer.close().await.unwrap();
        assert!(peer.close().await.is_err());
    }

    #[tokio::test]
    async fn test_silent_server_without_fallback_reports_no_hello() {
        let fake = FakeServer::bind().await; // never answers
        let config = PeerConfig {
            init_timeout_until_gateway: Some(Duration::from_millis(100)),
            ..test_config()
        };

        let err = Peer::new(CancellationToken::new(), "udp", &fake.addr_string(), config)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<NoHelloReceived>().is_some(), "got: {:#}", err);
    }

    #[tokio::test]
    async fn test_nat_fallback_discovers_and_maps() {
        let fake = FakeServer::bind().await; // never answers

        let mut discovery = MockGatewayDiscovery::new();
        discovery.expect_discover().times(1).returning(|| {
            let mut gateway = MockNatGateway::new();
            gateway
                .expect_add_port_mapping()
                .times(1)
                .returning(|_, _, _| Ok(()));
            let gateway: Arc<dyn NatGateway> = Arc::new(gateway);
            Ok(gateway)
        });

        let config = PeerConfig {
            init_timeout_until_gateway: Some(Duration::from_millis(100)),
            gateway_discovery: Some(Arc::new(discovery)),
            ..test_config()
        };

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                cancel.cancel();
            });
        }

        // the mapping goes in, but the second hello round is canceled, so
        // construction still fails - and not with the fallback sentinel
        let err = Peer::new(cancel, "udp", &fake.addr_string(), config)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<NoHelloReceived>().is_none(), "got: {:#}", err);
    }

    #[tokio::test]
    async fn test_fallback_not_attempted_when_disabled() {
        let fake = FakeServer::bind().await; // never answers

        // any call on the mock would panic the test
        let discovery = MockGatewayDiscovery::new();
        let config = PeerConfig {
            init_timeout_until_gateway: None,
            gateway_discovery: Some(Arc::new(discovery)),
            ..test_config()
        };

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                cancel.cancel();
            });
        }

        let err = Peer::new(cancel, "udp", &fake.addr_string(), config)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<NoHelloReceived>().is_none());
    }
}
