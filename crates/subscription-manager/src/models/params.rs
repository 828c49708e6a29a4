use std::sync::Arc;

use crate::models::media::{
    ParticipantId, SubscribedTrack, SubscriberInfo, TelemetrySink, TrackId, TrackResolver,
};

pub type TrackSubscribedCallback = Arc<dyn Fn(Arc<dyn SubscribedTrack>) + Send + Sync>;
pub type TrackUnsubscribedCallback = Arc<dyn Fn(Arc<dyn SubscribedTrack>) + Send + Sync>;
pub type SubscriptionErrorCallback = Arc<dyn Fn(TrackId) + Send + Sync>;
pub type SubscribeStatusCallback = Arc<dyn Fn(ParticipantId, bool) + Send + Sync>;

/// Collaborators handed to a `SubscriptionManager` at construction. One
/// manager exists per subscribing participant.
#[derive(Clone)]
pub struct SubscriptionManagerParams {
    pub subscriber: SubscriberInfo,
    pub resolver: Arc<dyn TrackResolver>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub on_track_subscribed: Option<TrackSubscribedCallback>,
    pub on_track_unsubscribed: Option<TrackUnsubscribedCallback>,
    pub on_subscription_error: Option<SubscriptionErrorCallback>,
}
