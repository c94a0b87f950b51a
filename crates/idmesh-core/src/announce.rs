//! Announce manager - decides when the identity must be re-signed.
//!
//! Owns the authoritative in-memory profile and node-claim list. Changes
//! arrive on a channel; a short debounce deadline coalesces bursts of edits
//! into one signing operation, and a long longevity deadline proactively
//! re-signs before peers' cached copies expire. A cached signature is reused
//! across restarts when re-encoding the current identity with the stored
//! timestamp reproduces the stored bytes exactly.
//!
//! Both deadlines are recomputed `Instant`s rather than reused timers, so a
//! reset can neither lose nor duplicate a fire.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use idmesh_wire::{IdentityPayload, KeyPair, RawMessage, CHAN_IDENTITY, TAG_IDENTITY};

use crate::config::AnnounceConfig;
use crate::events::ChangeEvent;
use crate::profile::Profile;
use crate::store::Store;

/// Debounced signing state machine for the local identity.
pub struct AnnounceManager {
    store: Store,
    key: KeyPair,
    config: AnnounceConfig,
    changes: mpsc::Receiver<ChangeEvent>,
    outbound: mpsc::Sender<RawMessage>,
    profile: Profile,
    profile_valid: bool,
    nodes: Vec<[u8; 32]>,
}

impl AnnounceManager {
    /// Create a manager. State is loaded from the store when [`run`] starts.
    ///
    /// [`run`]: AnnounceManager::run
    pub fn new(
        key: KeyPair,
        store: Store,
        config: AnnounceConfig,
        changes: mpsc::Receiver<ChangeEvent>,
        outbound: mpsc::Sender<RawMessage>,
    ) -> Self {
        Self {
            store,
            key,
            config,
            changes,
            outbound,
            profile: Profile::default(),
            profile_valid: false,
            nodes: Vec::new(),
        }
    }

    /// Run the event loop until cancellation or until the change channel
    /// closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.load_state().await;

        let mut remain = self.config.longevity;
        if self.profile_valid {
            let (msg, rem) = self.load_or_generate().await;
            remain = rem;
            if let Some(msg) = msg {
                if self.outbound.send(msg).await.is_err() {
                    warn!("announcement receiver closed before startup");
                    return;
                }
            }
        }

        let mut longevity_deadline = Instant::now() + remain;
        let mut debounce_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("announce manager stopping");
                    return;
                }
                event = self.changes.recv() => {
                    let Some(event) = event else {
                        debug!("change channel closed, announce manager stopping");
                        return;
                    };
                    if self.apply_change(event).await {
                        // coalesce bursts: every change pushes the deadline out
                        debounce_deadline = Some(Instant::now() + self.config.debounce);
                    }
                }
                _ = sleep_until_opt(debounce_deadline) => {
                    debounce_deadline = None;
                    let remain = self.announce_now().await;
                    longevity_deadline = Instant::now() + remain;
                }
                _ = tokio::time::sleep_until(longevity_deadline) => {
                    // proactive refresh so peers' cached copies never lapse
                    let remain = self.announce_now().await;
                    longevity_deadline = Instant::now() + remain;
                }
            }
        }
    }

    /// Apply one inbound change; returns whether the signable identity
    /// changed (and the debounce deadline should reset).
    async fn apply_change(&mut self, event: ChangeEvent) -> bool {
        match event {
            ChangeEvent::ProfileChanged(profile) => match profile.validate() {
                Ok(()) => {
                    info!(name = %profile.name, "received new profile");
                    self.profile = profile;
                    self.profile_valid = self.profile.is_valid();
                    if let Err(e) = self.store.set_profile(&self.profile).await {
                        warn!(error = %e, "cannot store profile");
                    }
                    true
                }
                Err(e) => {
                    warn!(error = %e, "received invalid profile (ignored)");
                    false
                }
            },
            ChangeEvent::NodeKeyAdded(key) => {
                debug!(node = %hex::encode(key), "received node pubkey");
                // persisting also refreshes last-seen for already-known keys
                if let Err(e) = self.store.add_profile_node(&key).await {
                    warn!(error = %e, "cannot store node pubkey");
                }
                if self.nodes.contains(&key) {
                    false
                } else {
                    self.nodes.push(key);
                    true
                }
            }
        }
    }

    /// Sign and emit, returning how long until the next proactive refresh.
    async fn announce_now(&mut self) -> Duration {
        if !self.profile_valid {
            return self.config.longevity;
        }
        let (msg, remain) = self.generate().await;
        if let Some(msg) = msg {
            info!("sending announcement to all peers");
            if self.outbound.send(msg).await.is_err() {
                warn!("announcement receiver closed");
            }
        }
        remain
    }

    /// Load persisted profile and node claims into the in-memory state.
    async fn load_state(&mut self) {
        match self.store.get_profile().await {
            Ok(profile) => {
                self.profile = profile;
                self.profile_valid = self.profile.is_valid();
            }
            Err(e) if e.is_not_found() => info!("no profile stored"),
            Err(e) => warn!(error = %e, "cannot load profile"),
        }
        match self.store.get_profile_nodes().await {
            Ok(nodes) => self.nodes = nodes,
            Err(e) => warn!(error = %e, "cannot load claimed node keys"),
        }
    }

    /// Reuse the stored announcement when nothing semantically changed,
    /// otherwise sign a fresh one.
    ///
    /// The stored bytes are untrusted (corrupt or legacy format must not
    /// crash): any parse failure falls through to fresh generation.
    async fn load_or_generate(&mut self) -> (Option<RawMessage>, Duration) {
        match self.store.get_announce().await {
            Ok(stored) => {
                let now = unix_now();
                if stored.payload.len() >= IdentityPayload::MIN_SIZE
                    && stored.sig.len() == 64
                    && now < stored.expires
                {
                    match IdentityPayload::decode(&stored.payload) {
                        Ok(old) => {
                            // same fields modulo time => same bytes
                            let candidate = self.current_payload(old.time);
                            if candidate.encode() == stored.payload {
                                let remaining = stored.expires - now;
                                info!(seconds = remaining, "re-using stored announcement");
                                match RawMessage::re_encode(
                                    CHAN_IDENTITY,
                                    TAG_IDENTITY,
                                    &self.key.public_bytes(),
                                    &stored.sig,
                                    stored.payload,
                                ) {
                                    Ok(msg) => {
                                        return (
                                            Some(msg),
                                            Duration::from_secs(remaining.max(0) as u64),
                                        );
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "cannot re-frame stored announcement");
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "stored announcement does not parse, regenerating");
                        }
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(error = %e, "cannot load announcement"),
        }
        self.generate().await
    }

    /// Sign a fresh announcement and persist it.
    ///
    /// Refuses while the profile is invalid or the node list is empty: a
    /// node-less identity would be invalidated the moment the first node key
    /// arrives, wasting a signature and a gossip round.
    async fn generate(&mut self) -> (Option<RawMessage>, Duration) {
        if !self.profile.is_valid() || self.nodes.is_empty() {
            return (None, self.config.longevity);
        }
        info!("signing a new announcement");
        let now = unix_now();
        let payload = self.current_payload(now as u64).encode();
        let msg = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &self.key, payload);

        let expires = now + self.config.longevity.as_secs() as i64;
        if let Err(e) = self
            .store
            .set_announce(&msg.payload, msg.signature(), expires)
            .await
        {
            warn!(error = %e, "cannot store announcement");
        }
        // make our identity visible to local lookups without a network trip
        if let Err(e) = self
            .store
            .set_identity(&self.key.public_bytes(), &msg.payload, msg.signature(), now)
            .await
        {
            warn!(error = %e, "cannot store own identity");
        }
        (Some(msg), self.config.longevity)
    }

    fn current_payload(&self, time: u64) -> IdentityPayload {
        self.profile.to_payload(self.nodes.clone(), time)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
