use serde::{Deserialize, Serialize};

/// Client preferences for a subscribed track. The manager buffers the most
/// recent value and transmits it opaquely to the forwarding layer; it never
/// interprets the fields itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTrackSettings {
    pub disabled: bool,
    pub width: u32,
    pub height: u32,
    pub priority: u32,
}
