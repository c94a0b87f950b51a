//! Protocol handler - the session with the local peer-routing daemon.
//!
//! Startup performs the channel-bind handshake, then three loops run
//! concurrently until the first of them fails:
//!
//! 1. inbound: read frames, store identity announcements
//! 2. own identity: forward freshly signed announcements from the announce
//!    manager verbatim
//! 3. gossip: periodically re-frame one random stored identity and send it,
//!    so identities signed by other nodes propagate beyond their signer
//!
//! Errors are fatal to the whole session: a half-broken duplex socket is not
//! safely continuable, so the handler returns and an external supervisor
//! restarts the service.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use idmesh_wire::{
    read_message, BindMessage, Endpoint, IdentityPayload, KeyPair, RawMessage, WireError,
    BIND_MESSAGE_SIZE, CHAN_IDENTITY, TAG_IDENTITY,
};

use crate::config::HandlerConfig;
use crate::error::{MeshError, MeshResult};
use crate::events::ChangeEvent;
use crate::store::Store;

/// Session with the peer-routing daemon on the identity channel.
pub struct IdentityHandler {
    store: Store,
    key: KeyPair,
    config: HandlerConfig,
    endpoint: Endpoint,
    new_identity: mpsc::Receiver<RawMessage>,
    changes: mpsc::Sender<ChangeEvent>,
}

enum DaemonStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl IdentityHandler {
    /// Create a handler.
    ///
    /// `new_identity` receives freshly signed announcements from the
    /// announce manager; `changes` feeds node-key claims back to it.
    pub fn new(
        store: Store,
        key: KeyPair,
        config: HandlerConfig,
        endpoint: Endpoint,
        new_identity: mpsc::Receiver<RawMessage>,
        changes: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            store,
            key,
            config,
            endpoint,
            new_identity,
            changes,
        }
    }

    /// Connect to the daemon and run the session until it fails or the
    /// token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> MeshResult<()> {
        let stream = connect(&self.endpoint).await?;
        info!(endpoint = %self.endpoint, "connected to daemon");
        match stream {
            DaemonStream::Tcp(s) => self.run_session(s, cancel).await,
            #[cfg(unix)]
            DaemonStream::Unix(s) => self.run_session(s, cancel).await,
        }
    }

    /// Run a session over an established stream.
    ///
    /// Split out from [`run`] so tests can drive the handler over an
    /// in-process duplex pipe.
    ///
    /// [`run`]: IdentityHandler::run
    pub async fn run_session<S>(mut self, stream: S, cancel: CancellationToken) -> MeshResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        // channel-bind handshake: name the channel, learn the daemon's node key
        let bind = BindMessage {
            version: 1,
            chan: CHAN_IDENTITY,
            pubkey: self.key.public_bytes(),
        };
        writer.write_all(&bind.encode()).await?;
        let mut reply = [0u8; BIND_MESSAGE_SIZE];
        reader.read_exact(&mut reply).await?;
        let reply = BindMessage::decode(&reply)?;
        info!(node = %hex::encode(reply.pubkey), "completed handshake");

        // the local node is by construction a claimed node of its own identity
        self.changes
            .send(ChangeEvent::NodeKeyAdded(reply.pubkey))
            .await
            .map_err(|_| MeshError::Connection("announce channel closed".to_string()))?;

        let writer = Arc::new(Mutex::new(writer));
        // first loop to fail wins the select and drops the others, which
        // closes both socket halves on return
        let result = tokio::select! {
            r = inbound_loop(&mut reader, &self.store) => r,
            r = own_identity_loop(&mut self.new_identity, Arc::clone(&writer)) => r,
            r = gossip_loop(&self.store, Arc::clone(&writer), &self.config) => r,
            _ = cancel.cancelled() => {
                debug!("identity handler stopping");
                Ok(())
            }
        };
        if let Err(e) = &result {
            warn!(error = %e, "daemon session failed");
        }
        result
    }
}

async fn connect(endpoint: &Endpoint) -> MeshResult<DaemonStream> {
    match endpoint {
        Endpoint::Tcp(addr) => Ok(DaemonStream::Tcp(TcpStream::connect(addr.as_str()).await?)),
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(DaemonStream::Unix(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(MeshError::Connection(
            "unix sockets are not supported on this platform".to_string(),
        )),
    }
}

/// Read frames until the socket fails; store identity announcements.
async fn inbound_loop<R>(reader: &mut R, store: &Store) -> MeshResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = read_message(reader).await?;
        if msg.chan != CHAN_IDENTITY {
            debug!(chan = %msg.chan, tag = %msg.tag, "ignored message");
            continue;
        }
        if msg.tag != TAG_IDENTITY {
            debug!(chan = %msg.chan, tag = %msg.tag, "unknown message");
            continue;
        }
        // payload bytes are untrusted: a malformed announcement is dropped,
        // not allowed to take the session down
        let identity = match IdentityPayload::decode(&msg.payload) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(signer = %hex::encode(msg.pubkey), error = %e, "undecodable identity frame");
                continue;
            }
        };
        info!(
            name = %identity.name,
            country = %identity.country,
            city = %identity.city,
            signer = %hex::encode(msg.pubkey),
            "received identity"
        );
        if let Err(e) = store
            .set_identity(&msg.pubkey, &msg.payload, &msg.sig, identity.time as i64)
            .await
        {
            warn!(signer = %hex::encode(msg.pubkey), error = %e, "cannot store identity");
        }
    }
}

/// Forward freshly signed announcements to the daemon as they arrive.
async fn own_identity_loop<W>(
    rx: &mut mpsc::Receiver<RawMessage>,
    writer: Arc<Mutex<W>>,
) -> MeshResult<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(msg) = rx.recv().await else {
            return Err(MeshError::Connection(
                "announce channel closed".to_string(),
            ));
        };
        info!("gossiping own identity");
        msg.send(&mut *writer.lock().await).await?;
        debug!(chan = %CHAN_IDENTITY, tag = %TAG_IDENTITY, "sent message");
    }
}

/// Anti-entropy: at a fixed interval, pick one stored identity at random and
/// re-send it with a fresh header.
async fn gossip_loop<W>(
    store: &Store,
    writer: Arc<Mutex<W>>,
    config: &HandlerConfig,
) -> MeshResult<()>
where
    W: AsyncWrite + Unpin,
{
    let start = tokio::time::Instant::now() + config.gossip_interval;
    let mut ticker = tokio::time::interval_at(start, config.gossip_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let record = match store.choose_identity().await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!("no identities to gossip");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "cannot choose identity to gossip");
                continue;
            }
        };
        let msg = match RawMessage::re_encode(
            CHAN_IDENTITY,
            TAG_IDENTITY,
            &record.pubkey,
            &record.sig,
            record.payload,
        ) {
            Ok(msg) => msg,
            Err(e @ WireError::SignatureLength(_)) => {
                warn!(signer = %hex::encode(record.pubkey), error = %e, "corrupt stored signature");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        msg.send(&mut *writer.lock().await).await?;
        debug!(signer = %hex::encode(record.pubkey), "gossiped stored identity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::open_test_store;
    use std::time::Duration;

    struct Fixture {
        store: Store,
        change_rx: mpsc::Receiver<ChangeEvent>,
        identity_tx: mpsc::Sender<RawMessage>,
        daemon: tokio::io::DuplexStream,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<MeshResult<()>>,
        _dir: tempfile::TempDir,
    }

    /// Spawn a handler session against an in-process pipe and complete the
    /// handshake from the daemon side.
    async fn start_session(config: HandlerConfig, daemon_key: [u8; 32]) -> Fixture {
        let (store, dir) = open_test_store();
        let (change_tx, change_rx) = mpsc::channel(16);
        let (identity_tx, identity_rx) = mpsc::channel(16);
        let (local, mut daemon) = tokio::io::duplex(64 * 1024);

        let handler = IdentityHandler::new(
            store.clone(),
            KeyPair::from_seed(&[1u8; 32]),
            config,
            Endpoint::Tcp("unused:0".to_string()),
            identity_rx,
            change_tx,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run_session(local, cancel.clone()));

        // daemon side of the handshake
        let mut bind = [0u8; BIND_MESSAGE_SIZE];
        daemon.read_exact(&mut bind).await.unwrap();
        let bind = BindMessage::decode(&bind).unwrap();
        assert_eq!(bind.version, 1);
        assert_eq!(bind.chan, CHAN_IDENTITY);
        let reply = BindMessage {
            version: 1,
            chan: CHAN_IDENTITY,
            pubkey: daemon_key,
        };
        daemon.write_all(&reply.encode()).await.unwrap();

        Fixture {
            store,
            change_rx,
            identity_tx,
            daemon,
            cancel,
            task,
            _dir: dir,
        }
    }

    fn slow_gossip() -> HandlerConfig {
        HandlerConfig {
            gossip_interval: Duration::from_secs(3600),
        }
    }

    async fn wait_for_identity(
        store: &Store,
        pubkey: &[u8; 32],
    ) -> crate::store::IdentityRecord {
        for _ in 0..100 {
            if let Ok(record) = store.get_identity(pubkey).await {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("identity was not stored in time");
    }

    #[tokio::test]
    async fn test_handshake_forwards_daemon_node_key() {
        let mut fx = start_session(slow_gossip(), [9u8; 32]).await;

        let event = tokio::time::timeout(Duration::from_secs(5), fx.change_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChangeEvent::NodeKeyAdded(key) => assert_eq!(key, [9u8; 32]),
            other => panic!("unexpected event: {:?}", other),
        }

        fx.cancel.cancel();
        fx.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inbound_identity_is_stored() {
        let mut fx = start_session(slow_gossip(), [9u8; 32]).await;
        let _ = fx.change_rx.recv().await;

        let peer = KeyPair::from_seed(&[7u8; 32]);
        let payload = IdentityPayload {
            time: 5000,
            name: "Peer".to_string(),
            nodes: vec![[3u8; 32]],
            ..Default::default()
        };
        let frame = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &peer, payload.encode());
        frame.send(&mut fx.daemon).await.unwrap();

        let record = wait_for_identity(&fx.store, &peer.public_bytes()).await;
        assert_eq!(record.payload, frame.payload);
        assert_eq!(record.time, 5000);

        fx.cancel.cancel();
        let _ = fx.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_channel_frames_are_discarded() {
        let mut fx = start_session(slow_gossip(), [9u8; 32]).await;
        let _ = fx.change_rx.recv().await;

        let peer = KeyPair::from_seed(&[7u8; 32]);
        let other_chan = idmesh_wire::Tag::new("Chat");
        let frame = RawMessage::encode(other_chan, TAG_IDENTITY, &peer, b"hi".to_vec());
        frame.send(&mut fx.daemon).await.unwrap();

        // follow with a good frame; if the bad one had killed the session
        // this one would never land
        let payload = IdentityPayload {
            time: 6000,
            name: "Peer".to_string(),
            ..Default::default()
        };
        let frame = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &peer, payload.encode());
        frame.send(&mut fx.daemon).await.unwrap();

        wait_for_identity(&fx.store, &peer.public_bytes()).await;
        fx.cancel.cancel();
        let _ = fx.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_own_identity_is_forwarded_verbatim() {
        let mut fx = start_session(slow_gossip(), [9u8; 32]).await;
        let _ = fx.change_rx.recv().await;

        let key = KeyPair::from_seed(&[1u8; 32]);
        let payload = IdentityPayload {
            time: 7000,
            name: "Self".to_string(),
            ..Default::default()
        };
        let msg = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &key, payload.encode());
        fx.identity_tx.send(msg.clone()).await.unwrap();

        let received = read_message(&mut fx.daemon).await.unwrap();
        assert_eq!(received.payload, msg.payload);
        assert_eq!(received.pubkey, key.public_bytes());

        fx.cancel.cancel();
        let _ = fx.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_gossip_loop_resends_stored_identity() {
        let peer = KeyPair::from_seed(&[7u8; 32]);
        let payload = IdentityPayload {
            time: 8000,
            name: "Stored".to_string(),
            ..Default::default()
        };
        let signed = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &peer, payload.encode());

        let mut fx = start_session(
            HandlerConfig {
                gossip_interval: Duration::from_millis(50),
            },
            [9u8; 32],
        )
        .await;
        let _ = fx.change_rx.recv().await;

        fx.store
            .set_identity(
                &peer.public_bytes(),
                &signed.payload,
                signed.signature(),
                8000,
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            read_message(&mut fx.daemon).await.unwrap()
        })
        .await
        .expect("gossip tick should resend the stored identity");
        assert_eq!(received.chan, CHAN_IDENTITY);
        assert_eq!(received.pubkey, peer.public_bytes());
        assert_eq!(received.payload, signed.payload);
        // re-framed, same signature: still verifies
        assert!(received.verify());

        fx.cancel.cancel();
        let _ = fx.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_close_tears_down_session() {
        let fx = start_session(slow_gossip(), [9u8; 32]).await;
        drop(fx.daemon);

        let result = tokio::time::timeout(Duration::from_secs(5), fx.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err(), "EOF on the socket must be fatal");
    }
}
