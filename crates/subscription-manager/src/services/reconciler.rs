use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, info, warn};

use crate::entities::subscription::{NotFoundVerdict, TrackSubscription};
use crate::errors::SubscriptionError;
use crate::models::media::SubscribedTrack;
use crate::subscription_manager::ManagerInner;

/// Reconciliation worker. Wakes on the periodic tick, on kicks posted by
/// the public API and media callbacks, or on cancellation, and drives every
/// subscription one step toward its desired terminal state. All structural
/// mutation of the subscriptions map happens here.
pub(crate) async fn run(inner: Arc<ManagerInner>, mut kick_rx: watch::Receiver<()>) {
    let mut ticker = interval(inner.config.reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            changed = kick_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        reconcile_all(&inner).await;
    }

    final_pass(&inner);
}

async fn reconcile_all(inner: &Arc<ManagerInner>) {
    let subscriptions: Vec<Arc<TrackSubscription>> =
        inner.subscriptions.read().values().cloned().collect();

    for sub in subscriptions {
        reconcile_subscription(inner, &sub).await;
    }
}

async fn reconcile_subscription(inner: &Arc<ManagerInner>, sub: &Arc<TrackSubscription>) {
    if sub.needs_cleanup() {
        cleanup(inner, sub);
    } else if sub.needs_unsubscribe() {
        unsubscribe(inner, sub);
    } else if sub.needs_bind() {
        // Bind is driven by the subscribed track's own callback; a stall
        // past the deadline is logged, never torn down, since the track's
        // close is the authoritative signal.
        if let Some(elapsed) = sub.subscribe_elapsed() {
            if elapsed > inner.config.subscription_timeout {
                warn!(
                    "track {} subscribed but not bound after {:?}",
                    sub.track_id(),
                    elapsed
                );
            }
        }
    } else if sub.needs_subscribe() {
        subscribe(inner, sub).await;
    } else if sub.is_desired() {
        // Steady state; push through any settings the client updated.
        if let Some((track, settings)) = sub.take_dirty_settings() {
            track.update_subscriber_settings(settings);
        }
    }
}

/// One subscribe attempt: resolve, register the change observer, then ask
/// the media track for a subscribed-track handle.
async fn subscribe(inner: &Arc<ManagerInner>, sub: &Arc<TrackSubscription>) {
    let subscriber = &inner.params.subscriber;
    let publisher_id = sub.publisher_id();
    let attempts = sub.record_attempt();
    debug!(
        "subscribing to track {} from {} (attempt {})",
        sub.track_id(),
        publisher_id,
        attempts
    );

    let resolving = inner
        .params
        .resolver
        .resolve(&subscriber.identity, &publisher_id, sub.track_id());
    let resolved = match timeout(inner.config.subscription_timeout, resolving).await {
        Ok(Ok(resolved)) => resolved,
        Ok(Err(err)) if err.is_not_found() => {
            handle_not_found(inner, sub);
            return;
        }
        Ok(Err(err)) => {
            handle_transient(inner, sub, err, attempts);
            return;
        }
        Err(_) => {
            handle_transient(inner, sub, SubscriptionError::Timeout, attempts);
            return;
        }
    };

    sub.mark_resolved();
    sub.set_publisher(&publisher_id, &resolved.publisher_identity);
    sub.set_has_permission(resolved.has_permission);

    // Register the wake-up on the publisher track, keyed by our own id so
    // teardown can always deregister it. A migrated publisher hands out a
    // new notifier; drop the registration on the old one.
    if let Some(notifier) = resolved.change_notifier.clone() {
        if let Some(previous) = sub.set_change_notifier(notifier.clone()) {
            previous.remove_observer(&subscriber.id);
        }
        let kick_tx = inner.kick_tx.clone();
        notifier.add_observer(
            &subscriber.id,
            Box::new(move || {
                let _ = kick_tx.send(());
            }),
        );
    }

    if sub.try_emit_requested() {
        inner
            .params
            .telemetry
            .track_subscribe_requested(&subscriber.id, sub.track_id());
    }

    if !resolved.has_permission {
        debug!(
            "not permitted to subscribe to track {}, waiting for a permission update",
            sub.track_id()
        );
        return;
    }

    let adding = resolved.track.add_subscriber(subscriber);
    let track = match timeout(inner.config.subscription_timeout, adding).await {
        Ok(Ok(track)) => track,
        Ok(Err(err)) => {
            handle_transient(inner, sub, err, attempts);
            return;
        }
        Err(_) => {
            handle_transient(inner, sub, SubscriptionError::Timeout, attempts);
            return;
        }
    };

    sub.establish(track.clone());

    let weak_inner = Arc::downgrade(inner);
    let weak_sub = Arc::downgrade(sub);
    let weak_track = Arc::downgrade(&track);
    track.on_close(Box::new(move |will_be_resumed| {
        let (Some(inner), Some(sub)) = (weak_inner.upgrade(), weak_sub.upgrade()) else {
            return;
        };
        let Some(closing) = weak_track.upgrade() else {
            return;
        };
        handle_subscribed_track_close(&inner, &sub, &closing, will_be_resumed);
    }));

    let weak_inner = Arc::downgrade(inner);
    let weak_sub = Arc::downgrade(sub);
    track.add_on_bind(Box::new(move || {
        let (Some(inner), Some(sub)) = (weak_inner.upgrade(), weak_sub.upgrade()) else {
            return;
        };
        handle_bound(&inner, &sub);
    }));

    // Replay buffered client settings onto the fresh handle.
    if let Some(settings) = sub.settings_for_replay() {
        track.update_subscriber_settings(settings);
    }

    info!(
        "subscribed to track {} from {}",
        sub.track_id(),
        publisher_id
    );
}

fn handle_not_found(inner: &Arc<ManagerInner>, sub: &Arc<TrackSubscription>) {
    match sub.record_not_found(inner.config.not_found_timeout) {
        NotFoundVerdict::Wait => {
            debug!("track {} not found yet, waiting", sub.track_id());
        }
        NotFoundVerdict::PublisherLeft => {
            // The publisher is gone; this is a normal departure, not an
            // error surfaced to the client.
            info!(
                "track {} no longer available, dropping subscription",
                sub.track_id()
            );
            sub.set_desired(false);
            inner.kick();
        }
        NotFoundVerdict::TimedOut => {
            warn!(
                "track {} was not found within {:?}, giving up",
                sub.track_id(),
                inner.config.not_found_timeout
            );
            sub.set_desired(false);
            emit_subscription_error(inner, sub, &SubscriptionError::TrackNotFound);
            inner.kick();
        }
    }
}

fn handle_transient(
    inner: &Arc<ManagerInner>,
    sub: &Arc<TrackSubscription>,
    error: SubscriptionError,
    attempts: u32,
) {
    warn!(
        "failed to subscribe to track {} (attempt {}): {}",
        sub.track_id(),
        attempts,
        error
    );

    if sub
        .subscribe_elapsed()
        .is_some_and(|elapsed| elapsed > inner.config.subscription_timeout)
    {
        emit_subscription_error(inner, sub, &error);
    }

    schedule_retry(inner, attempts);
}

/// Exponential backoff capped at the tick period; retries sooner than the
/// next tick are delayed kicks.
fn schedule_retry(inner: &Arc<ManagerInner>, attempts: u32) {
    let exponent = attempts.saturating_sub(1).min(6);
    let delay = inner
        .config
        .retry_backoff
        .saturating_mul(1u32 << exponent)
        .min(inner.config.reconcile_interval);

    let kick_tx = inner.kick_tx.clone();
    let cancel = inner.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(delay) => {
                let _ = kick_tx.send(());
            }
        }
    });
}

fn emit_subscription_error(
    inner: &Arc<ManagerInner>,
    sub: &Arc<TrackSubscription>,
    error: &SubscriptionError,
) {
    if !sub.try_emit_error() {
        return;
    }
    inner
        .params
        .telemetry
        .track_subscribe_failed(inner.subscriber_id(), sub.track_id(), error);
    if let Some(callback) = &inner.params.on_subscription_error {
        callback(sub.track_id().to_owned());
    }
}

/// Asks the media track to drop us. Repeated per tick until the handle's
/// close callback confirms; `remove_subscriber` is idempotent.
fn unsubscribe(inner: &Arc<ManagerInner>, sub: &Arc<TrackSubscription>) {
    let Some(track) = sub.subscribed_track() else {
        return;
    };
    debug!("unsubscribing from track {}", sub.track_id());
    track
        .media_track()
        .remove_subscriber(inner.subscriber_id(), false);
}

/// Terminal removal of an undesired, trackless subscription.
fn cleanup(inner: &Arc<ManagerInner>, sub: &Arc<TrackSubscription>) {
    if let Some(notifier) = sub.take_change_notifier() {
        notifier.remove_observer(inner.subscriber_id());
    }
    if sub.release_count() {
        inner.status.decrement(&sub.publisher_id());
    }

    let mut subscriptions = inner.subscriptions.write();
    // A subscribe may have revived the entry since the snapshot; re-check
    // under the write lock.
    if sub.needs_cleanup() {
        subscriptions.remove(sub.track_id());
        debug!("removed subscription for track {}", sub.track_id());
    }
}

/// Runs when a subscribed track's pipeline reports ready.
fn handle_bound(inner: &Arc<ManagerInner>, sub: &Arc<TrackSubscription>) {
    let Some(newly_counted) = sub.mark_bound() else {
        return;
    };
    let Some(track) = sub.subscribed_track() else {
        return;
    };
    debug!("track {} bound", sub.track_id());

    if newly_counted {
        inner.status.increment(&sub.publisher_id());
    }
    inner
        .params
        .telemetry
        .track_subscribed(inner.subscriber_id(), track.clone());
    if let Some(callback) = &inner.params.on_track_subscribed {
        callback(track);
    }
    inner.kick();
}

/// Runs when a subscribed track's forwarding stops. A resumed close leaves
/// `desired` intact and suppresses unsubscribe signals; the reconciler will
/// resubscribe on the next pass.
fn handle_subscribed_track_close(
    inner: &Arc<ManagerInner>,
    sub: &Arc<TrackSubscription>,
    closing: &Arc<dyn SubscribedTrack>,
    will_be_resumed: bool,
) {
    let outcome = sub.handle_closed(Some(closing), will_be_resumed);
    let Some(track) = outcome.track else {
        return;
    };
    debug!(
        "subscribed track {} closed (will be resumed: {})",
        sub.track_id(),
        will_be_resumed
    );

    if outcome.released {
        inner.status.decrement(&sub.publisher_id());
    }
    if outcome.was_bound && !will_be_resumed {
        inner
            .params
            .telemetry
            .track_unsubscribed(inner.subscriber_id(), track.clone());
        if let Some(callback) = &inner.params.on_track_unsubscribed {
            callback(track);
        }
    }
    inner.kick();
}

/// Teardown sweep after cancellation: every subscription is detached from
/// its publisher track and the map is drained.
fn final_pass(inner: &Arc<ManagerInner>) {
    let will_be_resumed = inner.close_resumed.load(Ordering::SeqCst);
    let subscriptions: Vec<Arc<TrackSubscription>> = {
        let mut map = inner.subscriptions.write();
        map.drain().map(|(_, sub)| sub).collect()
    };

    for sub in &subscriptions {
        teardown_subscription(inner, sub, will_be_resumed);
    }

    debug!(
        "subscription manager for {} shut down ({} subscriptions torn down)",
        inner.subscriber_id(),
        subscriptions.len()
    );
}

fn teardown_subscription(
    inner: &Arc<ManagerInner>,
    sub: &Arc<TrackSubscription>,
    will_be_resumed: bool,
) {
    if let Some(notifier) = sub.take_change_notifier() {
        notifier.remove_observer(inner.subscriber_id());
    }

    let outcome = sub.handle_closed(None, will_be_resumed);
    if let Some(track) = &outcome.track {
        track
            .media_track()
            .remove_subscriber(inner.subscriber_id(), will_be_resumed);
    }
    if outcome.released {
        inner.status.decrement(&sub.publisher_id());
    }
    if outcome.was_bound && !will_be_resumed {
        if let Some(track) = outcome.track {
            inner
                .params
                .telemetry
                .track_unsubscribed(inner.subscriber_id(), track.clone());
            if let Some(callback) = &inner.params.on_track_unsubscribed {
                callback(track);
            }
        }
    }
}
