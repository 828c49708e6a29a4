use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entities::subscription::TrackSubscription;
use crate::models::config::SubscriptionConfig;
use crate::models::media::{ParticipantId, SubscribedTrack, TrackId};
use crate::models::params::{SubscribeStatusCallback, SubscriptionManagerParams};
use crate::models::settings::UpdateTrackSettings;
use crate::services::reconciler;
use crate::services::status_tracker::StatusTracker;

pub(crate) struct ManagerInner {
    pub(crate) params: SubscriptionManagerParams,
    pub(crate) config: SubscriptionConfig,
    pub(crate) subscriptions: RwLock<HashMap<TrackId, Arc<TrackSubscription>>>,
    pub(crate) status: StatusTracker,
    pub(crate) kick_tx: watch::Sender<()>,
    pub(crate) cancel: CancellationToken,
    pub(crate) closed: AtomicBool,
    pub(crate) close_resumed: AtomicBool,
}

impl ManagerInner {
    pub(crate) fn subscriber_id(&self) -> &str {
        &self.params.subscriber.id
    }

    /// Wakes the reconciliation worker; coalesces with pending kicks.
    pub(crate) fn kick(&self) {
        let _ = self.kick_tx.send(());
    }
}

/// Reconciles one participant's desired set of remote tracks with the set
/// actually forwarded to it. Public operations are state submissions: they
/// record intent, wake the worker, and return; outcomes surface through
/// the registered callbacks and telemetry.
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(params: SubscriptionManagerParams, config: SubscriptionConfig) -> Self {
        let (kick_tx, kick_rx) = watch::channel(());
        let inner = Arc::new(ManagerInner {
            params,
            config,
            subscriptions: RwLock::new(HashMap::new()),
            status: StatusTracker::new(),
            kick_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_resumed: AtomicBool::new(false),
        });

        tokio::spawn(reconciler::run(inner.clone(), kick_rx));

        Self { inner }
    }

    /// Marks the track as desired. The worker resolves, subscribes, and
    /// retries from here; a track that does not exist yet is waited on for
    /// the configured grace window.
    pub fn subscribe_to_track(
        &self,
        publisher_identity: &str,
        publisher_id: &str,
        track_id: &str,
    ) {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("ignoring subscribe to track {} after close", track_id);
            return;
        }

        let sub = self.upsert_subscription(track_id, publisher_id, publisher_identity);
        sub.set_publisher(publisher_id, publisher_identity);
        sub.set_desired(true);
        debug!(
            "subscription to track {} from {} requested",
            track_id, publisher_id
        );
        self.inner.kick();
    }

    /// Marks the track as undesired; a no-op for unknown tracks.
    pub fn unsubscribe_from_track(&self, track_id: &str) {
        let sub = self.inner.subscriptions.read().get(track_id).cloned();
        let Some(sub) = sub else {
            return;
        };
        sub.set_desired(false);
        debug!("unsubscribe from track {} requested", track_id);
        self.inner.kick();
    }

    /// Buffers the client's latest preferences for a track. Settings sent
    /// before the subscription exists are held and replayed once the track
    /// is subscribed; otherwise the worker pushes them through on its next
    /// pass, so updates for one track always reach it in order.
    pub fn update_subscribed_track_settings(
        &self,
        track_id: &str,
        settings: UpdateTrackSettings,
    ) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let sub = self.upsert_subscription(track_id, "", "");
        sub.store_settings(settings);
        self.inner.kick();
    }

    /// Snapshot of the subscribed-track handles whose pipeline is live.
    pub fn get_subscribed_tracks(&self) -> Vec<Arc<dyn SubscribedTrack>> {
        self.inner
            .subscriptions
            .read()
            .values()
            .filter(|sub| sub.bound())
            .filter_map(|sub| sub.subscribed_track())
            .collect()
    }

    /// Snapshot of the publishers this participant currently receives at
    /// least one bound track from.
    pub fn get_subscribed_participants(&self) -> Vec<ParticipantId> {
        self.inner.status.subscribed_participants()
    }

    pub fn is_subscribed_to(&self, publisher_id: &str) -> bool {
        self.inner.status.is_subscribed_to(publisher_id)
    }

    /// Registers an observer for per-publisher subscribe-status changes.
    /// Observers hear only zero crossings of the bound-track refcount and
    /// run outside the manager's locks, in registration order.
    pub fn on_subscribe_status_changed(&self, callback: SubscribeStatusCallback) {
        self.inner.status.on_status_changed(callback);
    }

    /// Terminal shutdown. Every subscription is detached from its
    /// publisher track; `will_be_resumed` is passed through to the media
    /// layer so a migrating participant does not produce unsubscribe
    /// signals. A second close is a no-op.
    pub fn close(&self, will_be_resumed: bool) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .close_resumed
            .store(will_be_resumed, Ordering::SeqCst);
        info!(
            "closing subscription manager for {} (will be resumed: {})",
            self.inner.subscriber_id(),
            will_be_resumed
        );

        let subscriptions: Vec<Arc<TrackSubscription>> =
            self.inner.subscriptions.read().values().cloned().collect();
        for sub in subscriptions {
            sub.set_desired(false);
        }
        self.inner.cancel.cancel();
    }

    fn upsert_subscription(
        &self,
        track_id: &str,
        publisher_id: &str,
        publisher_identity: &str,
    ) -> Arc<TrackSubscription> {
        let mut subscriptions = self.inner.subscriptions.write();
        subscriptions
            .entry(track_id.to_owned())
            .or_insert_with(|| {
                Arc::new(TrackSubscription::new(
                    track_id.to_owned(),
                    publisher_id.to_owned(),
                    publisher_identity.to_owned(),
                ))
            })
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn subscription(&self, track_id: &str) -> Option<Arc<TrackSubscription>> {
        self.inner.subscriptions.read().get(track_id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close(false);
    }
}
