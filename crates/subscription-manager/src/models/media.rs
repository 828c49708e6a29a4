use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::SubscriptionError;
use crate::models::settings::UpdateTrackSettings;
use crate::utils::change_notifier::ChangeNotifier;

pub type TrackId = String;
pub type ParticipantId = String;
pub type ParticipantIdentity = String;

pub type OnBindCallback = Box<dyn Fn() + Send + Sync>;
pub type OnCloseCallback = Box<dyn Fn(bool) + Send + Sync>;

/// The subscribing participant, as the media layer needs to see it.
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub id: ParticipantId,
    pub identity: ParticipantIdentity,
}

/// A publisher's media track. Adding a subscriber is idempotent per
/// (track, subscriber) and yields the per-subscriber forwarding handle.
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> TrackId;

    fn publisher_id(&self) -> ParticipantId;

    async fn add_subscriber(
        &self,
        subscriber: &SubscriberInfo,
    ) -> Result<Arc<dyn SubscribedTrack>, SubscriptionError>;

    fn remove_subscriber(&self, subscriber_id: &str, will_be_resumed: bool);
}

/// Per-subscriber forwarding handle delivered by `MediaTrack::add_subscriber`.
pub trait SubscribedTrack: Send + Sync {
    fn id(&self) -> TrackId;

    fn publisher_id(&self) -> ParticipantId;

    fn publisher_identity(&self) -> ParticipantIdentity;

    fn media_track(&self) -> Arc<dyn MediaTrack>;

    /// Registers a callback invoked once the forwarding pipeline is live.
    /// May fire synchronously if the pipeline is already bound.
    fn add_on_bind(&self, callback: OnBindCallback);

    /// Single-slot close hook; fires exactly once when forwarding stops.
    /// The flag is true when the pipeline is expected to be recreated
    /// shortly (publisher migration).
    fn on_close(&self, callback: OnCloseCallback);

    fn update_subscriber_settings(&self, settings: UpdateTrackSettings);
}

/// What the resolver knows about a publisher track at one point in time.
#[derive(Clone)]
pub struct MediaResolverResult {
    pub track: Arc<dyn MediaTrack>,
    /// Observable trigger on the publisher track; fires when permissions or
    /// track composition change and the subscriber should re-resolve.
    pub change_notifier: Option<Arc<ChangeNotifier>>,
    pub has_permission: bool,
    pub publisher_identity: ParticipantIdentity,
}

/// Maps (subscriber identity, publisher, track) to a live media track plus
/// a permission verdict.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(
        &self,
        identity: &str,
        publisher_id: &str,
        track_id: &str,
    ) -> Result<MediaResolverResult, SubscriptionError>;
}

/// Fire-and-forget event recorder. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn track_subscribe_requested(&self, subscriber_id: &str, track_id: &str);

    fn track_subscribed(&self, subscriber_id: &str, track: Arc<dyn SubscribedTrack>);

    fn track_unsubscribed(&self, subscriber_id: &str, track: Arc<dyn SubscribedTrack>);

    fn track_subscribe_failed(&self, subscriber_id: &str, track_id: &str, error: &SubscriptionError);
}
