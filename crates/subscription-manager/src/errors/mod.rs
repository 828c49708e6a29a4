use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("track not found")]
    TrackNotFound,

    #[error("media operation timed out")]
    Timeout,

    #[error("failed to add subscriber to track")]
    FailedToAddSubscriber,

    #[error("resolver failure: {0}")]
    ResolverFailure(String),
}

impl SubscriptionError {
    /// True for the typed not-found error, which has its own grace-window
    /// handling instead of the transient retry path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SubscriptionError::TrackNotFound)
    }
}
