use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::message::{Fingerprint, Message, MessageKind, MAX_MESSAGE_SIZE};
use crate::mingle_set::MingleSet;
use crate::util::net::blast;

/// Predicate applied to the fingerprint of every inbound frame; returning false
///  drops the frame silently. See [ServerConfig::fingerprint_check].
pub type FingerprintCheck = Box<dyn Fn(&Fingerprint) -> bool + Send + Sync>;

pub struct ServerConfig {
    /// Copies of each outbound datagram, in case some are dropped.
    pub packet_blast_count: usize,

    /// How many ready-to-mingle peers are asked to meet each newcomer.
    pub peers_to_meet: usize,

    /// How long a peer stays introducible after its last ReadyToMingle.
    pub ready_to_mingle_timeout: Duration,

    /// Upper bound on concurrently running packet handlers.
    pub max_concurrent: usize,

    /// Optional filter over inbound fingerprints. One use is a pre-shared key: peers
    ///  put random bytes plus an HMAC of them into the fingerprint, and the check
    ///  verifies the proof before the peer is allowed to rendezvous.
    pub fingerprint_check: Option<FingerprintCheck>,

    /// Errors encountered while interacting with peers are offered here. If unset,
    ///  or whenever the channel is full, they are dropped; the packet path never
    ///  blocks on an observer.
    pub err_tx: Option<mpsc::Sender<anyhow::Error>>,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            packet_blast_count: 3,
            peers_to_meet: 3,
            ready_to_mingle_timeout: Duration::from_secs(120),
            max_concurrent: 500,
            fingerprint_check: None,
            err_tx: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new()
    }
}

/// The rendezvous server: it introduces newcomers to recently seen peers and
///  forwards no traffic itself. All state it keeps is the [MingleSet], which decays
///  on its own; restarting a server loses nothing durable.
pub struct Server {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    config: ServerConfig,
    mingle_set: MingleSet,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            shared: Arc::new(ServerShared {
                config,
                mingle_set: MingleSet::new(),
            }),
        }
    }

    /// Binds `addr` and serves rendezvous traffic until `cancel` fires or the socket
    ///  fails. Each datagram is handled on its own task, admitted by a semaphore of
    ///  depth [ServerConfig::max_concurrent]; shutdown waits for in-flight handlers.
    ///
    /// Panics if `network` is anything other than `"udp"`.
    pub async fn listen(&self, cancel: CancellationToken, network: &str, addr: &str) -> anyhow::Result<()> {
        assert_eq!(network, "udp", "only network 'udp' is supported by listen");

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        debug!(addr = %socket.local_addr()?, "listening");

        let throttle = Arc::new(Semaphore::new(self.shared.config.max_concurrent));
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut expiry = interval(self.shared.config.ready_to_mingle_timeout / 2);

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            // reap finished handlers so the join set does not grow without bound
            while handlers.try_join_next().is_some() {}

            select! {
                _ = cancel.cancelled() => break,
                _ = expiry.tick() => {
                    if let Some(cutoff) = Instant::now().checked_sub(self.shared.config.ready_to_mingle_timeout) {
                        self.shared.mingle_set.expire(cutoff);
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, src) = received?;
                    let datagram = buf[..n].to_vec();
                    let permit = throttle.clone().acquire_owned().await?;
                    let shared = self.shared.clone();
                    let socket = socket.clone();
                    handlers.spawn(async move {
                        shared.handle_packet(&socket, datagram, src).await;
                        drop(permit);
                    });
                }
            }
        }

        debug!("shutting down, waiting for in-flight handlers");
        while handlers.join_next().await.is_some() {}
        Ok(())
    }
}

impl ServerShared {
    async fn handle_packet(&self, socket: &UdpSocket, datagram: Vec<u8>, src: SocketAddr) {
        let msg = match Message::try_deser(&datagram) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(%src, "dropping malformed datagram: {}", e);
                self.report_err(anyhow!(e));
                return;
            }
        };

        if let Some(check) = &self.config.fingerprint_check {
            if !check(&msg.fingerprint) {
                trace!(%src, "dropping datagram with rejected fingerprint");
                return;
            }
        }

        match msg.kind {
            MessageKind::HelloServer => self.introduce(socket, src, msg.fingerprint).await,
            MessageKind::ReadyToMingle => self.mingle_set.add(src, msg.fingerprint),
            MessageKind::HelloPeer { .. } | MessageKind::Meet { .. } => {
                trace!(%src, kind = %msg.kind, "ignoring peer-to-peer message");
            }
        }
    }

    /// Asks up to `peers_to_meet` minglers to greet the newcomer at `src`. Each Meet
    ///  is addressed with the mingler's own fingerprint so its mux picks the frame
    ///  up, and embeds the newcomer's so the mingler's reply is recognizable in turn.
    async fn introduce(&self, socket: &UdpSocket, src: SocketAddr, fingerprint: Fingerprint) {
        let min = Instant::now().checked_sub(self.config.ready_to_mingle_timeout);
        let minglers = self.mingle_set.get(self.config.peers_to_meet, min);

        for mingler in &minglers {
            debug!(newcomer = %src, mingler = %mingler.addr, "introducing");
            let meet = Message {
                fingerprint: mingler.fingerprint,
                kind: MessageKind::Meet { addr: src, fingerprint },
            };
            if let Err(e) = blast(socket, mingler.addr, self.config.packet_blast_count, &meet).await {
                warn!(mingler = %mingler.addr, "sending Meet failed: {}", e);
                self.report_err(e);
            }
        }

        // A newcomer that got fewer introductions than asked for still needs to
        //  learn its external address, so the server says hello itself.
        if minglers.len() < self.config.peers_to_meet {
            let hello = Message {
                fingerprint,
                kind: MessageKind::HelloPeer { addr: src },
            };
            if let Err(e) = blast(socket, src, self.config.packet_blast_count, &hello).await {
                warn!(newcomer = %src, "sending HelloPeer failed: {}", e);
                self.report_err(e);
            }
        }
    }

    fn report_err(&self, err: anyhow::Error) {
        if let Some(tx) = &self.config.err_tx {
            let _ = tx.try_send(err);
        }
    }
}
