use dashmap::DashMap;

type ObserverCallback = Box<dyn Fn() + Send + Sync>;

/// Observer registry attached to a publisher track. Subscribers register a
/// wake-up under their own participant id and deregister it on teardown;
/// keying by subscriber id keeps deregistration correct even when several
/// subscribers of the same track contend.
#[derive(Default)]
pub struct ChangeNotifier {
    observers: DashMap<String, ObserverCallback>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            observers: DashMap::new(),
        }
    }

    /// Registers a callback under `key`, replacing any previous one.
    pub fn add_observer(&self, key: &str, callback: ObserverCallback) {
        self.observers.insert(key.to_owned(), callback);
    }

    pub fn remove_observer(&self, key: &str) {
        self.observers.remove(key);
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    /// Invokes every registered observer. Callbacks must not re-enter the
    /// notifier; they are expected to be cheap wake-up signals.
    pub fn notify_changed(&self) {
        for entry in self.observers.iter() {
            (entry.value())();
        }
    }
}
