use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::models::media::ParticipantId;
use crate::models::params::SubscribeStatusCallback;

/// Per-publisher refcount of bound tracks for one subscriber. Observers
/// hear about zero crossings only, so N tracks from the same publisher
/// produce a single subscribed=true and a single subscribed=false.
pub struct StatusTracker {
    counts: Mutex<HashMap<ParticipantId, usize>>,
    callbacks: RwLock<Vec<SubscribeStatusCallback>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Registers an observer; callbacks run in registration order, outside
    /// the refcount lock.
    pub fn on_status_changed(&self, callback: SubscribeStatusCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn increment(&self, publisher_id: &str) {
        let crossed = {
            let mut counts = self.counts.lock();
            let count = counts.entry(publisher_id.to_owned()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if crossed {
            debug!("subscribed to participant {}", publisher_id);
            self.emit(publisher_id, true);
        }
    }

    pub fn decrement(&self, publisher_id: &str) {
        let crossed = {
            let mut counts = self.counts.lock();
            match counts.get_mut(publisher_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(publisher_id);
                    true
                }
                None => false,
            }
        };
        if crossed {
            debug!("unsubscribed from participant {}", publisher_id);
            self.emit(publisher_id, false);
        }
    }

    pub fn subscribed_participants(&self) -> Vec<ParticipantId> {
        self.counts.lock().keys().cloned().collect()
    }

    pub fn is_subscribed_to(&self, publisher_id: &str) -> bool {
        self.counts.lock().contains_key(publisher_id)
    }

    fn emit(&self, publisher_id: &str, subscribed: bool) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(publisher_id.to_owned(), subscribed);
        }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_tracker() -> (StatusTracker, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let tracker = StatusTracker::new();
        let subscribed = Arc::new(AtomicUsize::new(0));
        let unsubscribed = Arc::new(AtomicUsize::new(0));

        let on = subscribed.clone();
        let off = unsubscribed.clone();
        tracker.on_status_changed(Arc::new(move |_pub_id, is_subscribed| {
            if is_subscribed {
                on.fetch_add(1, Ordering::SeqCst);
            } else {
                off.fetch_add(1, Ordering::SeqCst);
            }
        }));

        (tracker, subscribed, unsubscribed)
    }

    #[test]
    fn test_emits_only_on_zero_crossings() {
        let (tracker, subscribed, unsubscribed) = counting_tracker();

        tracker.increment("pubID");
        tracker.increment("pubID");
        assert_eq!(subscribed.load(Ordering::SeqCst), 1);

        tracker.decrement("pubID");
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 0);

        tracker.decrement("pubID");
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
        assert!(!tracker.is_subscribed_to("pubID"));
    }

    #[test]
    fn test_decrement_without_count_is_noop() {
        let (tracker, _, unsubscribed) = counting_tracker();
        tracker.decrement("pubID");
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tracks_distinct_publishers() {
        let (tracker, subscribed, _) = counting_tracker();

        tracker.increment("pub-a");
        tracker.increment("pub-b");
        assert_eq!(subscribed.load(Ordering::SeqCst), 2);

        let mut participants = tracker.subscribed_participants();
        participants.sort();
        assert_eq!(participants, vec!["pub-a".to_owned(), "pub-b".to_owned()]);
    }
}
