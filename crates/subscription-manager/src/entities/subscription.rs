use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::media::{ParticipantId, ParticipantIdentity, SubscribedTrack, TrackId};
use crate::models::settings::UpdateTrackSettings;
use crate::utils::change_notifier::ChangeNotifier;

/// Verdict for a resolver round that came back with `TrackNotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundVerdict {
    /// Inside the grace window; stay in this state until the next tick.
    Wait,
    /// The track had resolved before, so the publisher is gone. Terminal
    /// for `desired`, no error surfaced.
    PublisherLeft,
    /// Never resolved and the grace window has elapsed. Terminal for
    /// `desired`; the error callback fires once.
    TimedOut,
}

/// What a close did to the subscription, reported so the caller can emit
/// refcount changes and telemetry outside the state lock.
#[derive(Default)]
pub struct CloseOutcome {
    /// The handle that was cleared, if any.
    pub track: Option<Arc<dyn SubscribedTrack>>,
    pub was_bound: bool,
    /// The subscription stopped contributing to the publisher refcount.
    pub released: bool,
}

struct State {
    publisher_id: ParticipantId,
    publisher_identity: ParticipantIdentity,
    desired: bool,
    /// Set the first time the client asks for this track; entries created
    /// by a settings update alone stay out of cleanup until then.
    desired_ever: bool,
    has_permission: bool,
    subscribed_track: Option<Arc<dyn SubscribedTrack>>,
    bound: bool,
    /// Currently contributing to the per-publisher bound refcount.
    counted: bool,
    change_notifier: Option<Arc<ChangeNotifier>>,
    settings: Option<UpdateTrackSettings>,
    /// Settings have not yet reached the current subscribed-track handle.
    settings_dirty: bool,
    subscribe_attempts: u32,
    subscribe_started_at: Option<Instant>,
    not_found_since: Option<Instant>,
    /// Once the resolver has seen the track, a later not-found means the
    /// publisher left rather than "not there yet".
    resolved_once: bool,
    requested_emitted: bool,
    error_emitted: bool,
}

/// Per-(subscriber, track) subscription state. Mutations are atomic at the
/// level of a single subscription; readers get consistent snapshots. The
/// reconciler owns all multi-step transitions.
pub struct TrackSubscription {
    track_id: TrackId,
    state: Mutex<State>,
}

impl TrackSubscription {
    pub fn new(
        track_id: TrackId,
        publisher_id: ParticipantId,
        publisher_identity: ParticipantIdentity,
    ) -> Self {
        Self {
            track_id,
            state: Mutex::new(State {
                publisher_id,
                publisher_identity,
                desired: false,
                desired_ever: false,
                has_permission: false,
                subscribed_track: None,
                bound: false,
                counted: false,
                change_notifier: None,
                settings: None,
                settings_dirty: false,
                subscribe_attempts: 0,
                subscribe_started_at: None,
                not_found_since: None,
                resolved_once: false,
                requested_emitted: false,
                error_emitted: false,
            }),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn is_desired(&self) -> bool {
        self.state.lock().desired
    }

    pub fn needs_subscribe(&self) -> bool {
        let s = self.state.lock();
        s.desired && s.subscribed_track.is_none()
    }

    pub fn needs_unsubscribe(&self) -> bool {
        let s = self.state.lock();
        !s.desired && s.subscribed_track.is_some()
    }

    pub fn needs_bind(&self) -> bool {
        let s = self.state.lock();
        s.subscribed_track.is_some() && !s.bound
    }

    /// Undesired, trackless, and was desired at some point. Entries that
    /// only ever buffered settings are kept for the subscribe that may
    /// still arrive.
    pub fn needs_cleanup(&self) -> bool {
        let s = self.state.lock();
        !s.desired && s.subscribed_track.is_none() && s.desired_ever
    }

    pub fn bound(&self) -> bool {
        self.state.lock().bound
    }

    pub fn has_permission(&self) -> bool {
        self.state.lock().has_permission
    }

    pub fn subscribed_track(&self) -> Option<Arc<dyn SubscribedTrack>> {
        self.state.lock().subscribed_track.clone()
    }

    pub fn publisher_id(&self) -> ParticipantId {
        self.state.lock().publisher_id.clone()
    }

    pub fn publisher_identity(&self) -> ParticipantIdentity {
        self.state.lock().publisher_identity.clone()
    }

    /// Returns true when the flag actually changed. Re-desiring a
    /// subscription restarts its retry and not-found accounting and
    /// re-arms the one-shot error callback.
    pub fn set_desired(&self, desired: bool) -> bool {
        let mut s = self.state.lock();
        if desired {
            s.desired_ever = true;
        }
        if s.desired == desired {
            return false;
        }
        s.desired = desired;
        if desired {
            s.subscribe_attempts = 0;
            s.subscribe_started_at = None;
            s.not_found_since = None;
            s.error_emitted = false;
        }
        true
    }

    pub fn set_has_permission(&self, has_permission: bool) {
        self.state.lock().has_permission = has_permission;
    }

    pub fn set_publisher(&self, publisher_id: &str, publisher_identity: &str) {
        let mut s = self.state.lock();
        s.publisher_id = publisher_id.to_owned();
        if !publisher_identity.is_empty() {
            s.publisher_identity = publisher_identity.to_owned();
        }
    }

    /// A fresh subscribed-track handle was delivered. Resets the bind flag
    /// and retry accounting; the bind-stall clock starts here.
    pub fn establish(&self, track: Arc<dyn SubscribedTrack>) {
        let mut s = self.state.lock();
        s.subscribed_track = Some(track);
        s.bound = false;
        s.subscribe_attempts = 0;
        s.subscribe_started_at = Some(Instant::now());
    }

    /// Marks the pipeline bound. Returns `None` when there is nothing to
    /// bind (handle already gone or already bound), otherwise whether this
    /// subscription newly joined the publisher refcount.
    pub fn mark_bound(&self) -> Option<bool> {
        let mut s = self.state.lock();
        if s.subscribed_track.is_none() || s.bound {
            return None;
        }
        s.bound = true;
        let newly_counted = !s.counted;
        s.counted = true;
        Some(newly_counted)
    }

    /// Clears the subscribed track. `closing` restricts the effect to one
    /// particular handle so a stale close from a replaced handle is a
    /// no-op; `None` clears unconditionally (manager teardown).
    ///
    /// A resumed close keeps the refcount contribution so the gap emits
    /// neither an unsubscribed nor a duplicate subscribed status event.
    pub fn handle_closed(
        &self,
        closing: Option<&Arc<dyn SubscribedTrack>>,
        will_be_resumed: bool,
    ) -> CloseOutcome {
        let mut s = self.state.lock();
        let Some(current) = s.subscribed_track.clone() else {
            return CloseOutcome::default();
        };
        if let Some(closing) = closing {
            if !Arc::ptr_eq(closing, &current) {
                return CloseOutcome::default();
            }
        }

        s.subscribed_track = None;
        let was_bound = s.bound;
        s.bound = false;
        if s.settings.is_some() {
            s.settings_dirty = true;
        }
        let released = if s.counted && !will_be_resumed {
            s.counted = false;
            true
        } else {
            false
        };

        CloseOutcome {
            track: Some(current),
            was_bound,
            released,
        }
    }

    /// Drops the refcount contribution outside the close path (cleanup of
    /// a subscription whose handle vanished during a resume gap).
    pub fn release_count(&self) -> bool {
        let mut s = self.state.lock();
        if s.counted {
            s.counted = false;
            true
        } else {
            false
        }
    }

    /// Buffers the most recent settings and marks them dirty. Only the
    /// reconciler delivers them to the subscribed track, which keeps
    /// concurrent updates for the same track from landing out of order.
    pub fn store_settings(&self, settings: UpdateTrackSettings) {
        let mut s = self.state.lock();
        s.settings = Some(settings);
        s.settings_dirty = true;
    }

    /// Settings to replay onto a just-established handle, if any.
    pub fn settings_for_replay(&self) -> Option<UpdateTrackSettings> {
        let mut s = self.state.lock();
        let settings = s.settings.clone()?;
        s.settings_dirty = false;
        Some(settings)
    }

    /// Steady-state replay: dirty settings plus the handle to apply them
    /// to, clearing the dirty bit.
    pub fn take_dirty_settings(&self) -> Option<(Arc<dyn SubscribedTrack>, UpdateTrackSettings)> {
        let mut s = self.state.lock();
        if !s.settings_dirty {
            return None;
        }
        let track = s.subscribed_track.clone()?;
        let settings = s.settings.clone()?;
        s.settings_dirty = false;
        Some((track, settings))
    }

    /// Counts a subscribe attempt and starts the attempt deadline clock on
    /// the first one. Returns the attempt number.
    pub fn record_attempt(&self) -> u32 {
        let mut s = self.state.lock();
        s.subscribe_attempts += 1;
        if s.subscribe_started_at.is_none() {
            s.subscribe_started_at = Some(Instant::now());
        }
        s.subscribe_attempts
    }

    pub fn subscribe_elapsed(&self) -> Option<Duration> {
        self.state.lock().subscribe_started_at.map(|t| t.elapsed())
    }

    /// Folds a `TrackNotFound` resolver round into the state.
    pub fn record_not_found(&self, not_found_timeout: Duration) -> NotFoundVerdict {
        let mut s = self.state.lock();
        if s.resolved_once {
            return NotFoundVerdict::PublisherLeft;
        }
        let since = *s.not_found_since.get_or_insert_with(Instant::now);
        if since.elapsed() > not_found_timeout {
            NotFoundVerdict::TimedOut
        } else {
            NotFoundVerdict::Wait
        }
    }

    pub fn mark_resolved(&self) {
        let mut s = self.state.lock();
        s.resolved_once = true;
        s.not_found_since = None;
    }

    /// One-shot latch for the subscribe-requested telemetry event.
    pub fn try_emit_requested(&self) -> bool {
        let mut s = self.state.lock();
        if s.requested_emitted {
            return false;
        }
        s.requested_emitted = true;
        true
    }

    /// One-shot latch for the subscription error callback.
    pub fn try_emit_error(&self) -> bool {
        let mut s = self.state.lock();
        if s.error_emitted {
            return false;
        }
        s.error_emitted = true;
        true
    }

    /// Stores the notifier for this publisher track, returning the one it
    /// replaced when the publisher migrated to a different track object.
    pub fn set_change_notifier(
        &self,
        notifier: Arc<ChangeNotifier>,
    ) -> Option<Arc<ChangeNotifier>> {
        let mut s = self.state.lock();
        let previous = s.change_notifier.take();
        s.change_notifier = Some(notifier.clone());
        match previous {
            Some(prev) if !Arc::ptr_eq(&prev, &notifier) => Some(prev),
            _ => None,
        }
    }

    pub fn take_change_notifier(&self) -> Option<Arc<ChangeNotifier>> {
        self.state.lock().change_notifier.take()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::errors::SubscriptionError;
    use crate::models::media::{MediaTrack, OnBindCallback, OnCloseCallback};

    use super::*;

    struct StubSubscribedTrack;

    impl SubscribedTrack for StubSubscribedTrack {
        fn id(&self) -> TrackId {
            "track".to_owned()
        }

        fn publisher_id(&self) -> ParticipantId {
            "pubID".to_owned()
        }

        fn publisher_identity(&self) -> ParticipantIdentity {
            "pub".to_owned()
        }

        fn media_track(&self) -> Arc<dyn MediaTrack> {
            unimplemented!("not exercised by these tests")
        }

        fn add_on_bind(&self, _callback: OnBindCallback) {}

        fn on_close(&self, _callback: OnCloseCallback) {}

        fn update_subscriber_settings(&self, _settings: UpdateTrackSettings) {}
    }

    fn new_subscription() -> TrackSubscription {
        TrackSubscription::new("track".to_owned(), "pubID".to_owned(), "pub".to_owned())
    }

    fn stub_track() -> Arc<dyn SubscribedTrack> {
        Arc::new(StubSubscribedTrack)
    }

    #[test]
    fn test_predicates_follow_lifecycle() {
        let sub = new_subscription();
        assert!(!sub.needs_subscribe());
        assert!(!sub.needs_cleanup());

        sub.set_desired(true);
        assert!(sub.needs_subscribe());
        assert!(!sub.needs_unsubscribe());

        sub.establish(stub_track());
        assert!(!sub.needs_subscribe());
        assert!(sub.needs_bind());

        assert_eq!(sub.mark_bound(), Some(true));
        assert!(!sub.needs_bind());

        sub.set_desired(false);
        assert!(sub.needs_unsubscribe());

        let outcome = sub.handle_closed(None, false);
        assert!(outcome.was_bound);
        assert!(outcome.released);
        assert!(sub.needs_cleanup());
    }

    #[test]
    fn test_settings_only_entry_is_not_cleanup_eligible() {
        let sub = new_subscription();
        sub.store_settings(UpdateTrackSettings::default());
        assert!(!sub.needs_cleanup());

        sub.set_desired(true);
        sub.set_desired(false);
        assert!(sub.needs_cleanup());
    }

    #[test]
    fn test_settings_buffered_until_establish() {
        let sub = new_subscription();
        let settings = UpdateTrackSettings {
            disabled: true,
            width: 100,
            height: 100,
            priority: 0,
        };
        sub.store_settings(settings.clone());
        // No handle yet, nothing to deliver to.
        assert!(sub.take_dirty_settings().is_none());

        sub.establish(stub_track());
        assert_eq!(sub.settings_for_replay(), Some(settings));
        // Replayed once; nothing left dirty.
        assert!(sub.take_dirty_settings().is_none());
    }

    #[test]
    fn test_settings_dirty_again_after_close() {
        let sub = new_subscription();
        sub.establish(stub_track());
        assert!(sub.settings_for_replay().is_none());

        sub.store_settings(UpdateTrackSettings::default());
        assert!(sub.take_dirty_settings().is_some());
        assert!(sub.take_dirty_settings().is_none());

        sub.handle_closed(None, true);
        sub.establish(stub_track());
        assert!(sub.settings_for_replay().is_some());
    }

    #[test]
    fn test_stale_close_is_ignored() {
        let sub = new_subscription();
        let old = stub_track();
        sub.establish(old.clone());
        sub.handle_closed(None, false);

        let new = stub_track();
        sub.establish(new.clone());
        let outcome = sub.handle_closed(Some(&old), false);
        assert!(outcome.track.is_none());
        assert!(sub.subscribed_track().is_some());
    }

    #[test]
    fn test_resumed_close_keeps_refcount_contribution() {
        let sub = new_subscription();
        sub.set_desired(true);
        sub.establish(stub_track());
        assert_eq!(sub.mark_bound(), Some(true));

        let outcome = sub.handle_closed(None, true);
        assert!(outcome.was_bound);
        assert!(!outcome.released);

        // The rebind after a resume does not join the refcount again.
        sub.establish(stub_track());
        assert_eq!(sub.mark_bound(), Some(false));
    }

    #[test]
    fn test_not_found_grace_window() {
        let sub = new_subscription();
        sub.set_desired(true);

        assert_eq!(
            sub.record_not_found(Duration::from_millis(200)),
            NotFoundVerdict::Wait
        );
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(
            sub.record_not_found(Duration::from_millis(200)),
            NotFoundVerdict::TimedOut
        );
    }

    #[test]
    fn test_not_found_after_resolve_is_publisher_left() {
        let sub = new_subscription();
        sub.set_desired(true);
        sub.mark_resolved();
        assert_eq!(
            sub.record_not_found(Duration::from_millis(200)),
            NotFoundVerdict::PublisherLeft
        );
    }

    #[test]
    fn test_one_shot_latches() {
        let sub = new_subscription();
        assert!(sub.try_emit_requested());
        assert!(!sub.try_emit_requested());

        assert!(sub.try_emit_error());
        assert!(!sub.try_emit_error());

        // Re-desiring re-arms the error latch but not the requested one.
        sub.set_desired(true);
        sub.set_desired(false);
        sub.set_desired(true);
        assert!(sub.try_emit_error());
        assert!(!sub.try_emit_requested());
    }

    #[test]
    fn test_change_notifier_swap_reports_replaced() {
        let sub = new_subscription();
        let first = Arc::new(ChangeNotifier::new());
        let second = Arc::new(ChangeNotifier::new());

        assert!(sub.set_change_notifier(first.clone()).is_none());
        // Same notifier again is not a swap.
        assert!(sub.set_change_notifier(first.clone()).is_none());
        let replaced = sub.set_change_notifier(second).expect("swap");
        assert!(Arc::ptr_eq(&replaced, &first));
    }

    #[test]
    fn test_error_kind_helper() {
        assert!(SubscriptionError::TrackNotFound.is_not_found());
        assert!(!SubscriptionError::Timeout.is_not_found());
    }
}
