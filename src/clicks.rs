//! The click-counting aggregate served by the `streamfold` binary.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

/// Number of clicks seen for one user key.
///
/// Serializes as `{"Clicks":N}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClicks {
    /// Click count.
    #[serde(rename = "Clicks")]
    pub clicks: u64,
}

impl Aggregate for UserClicks {
    /// The click payload. Its content is ignored; every event is one click.
    type Event = String;

    fn apply(mut self, _event: &String) -> Self {
        self.clicks = self.clicks.saturating_add(1);
        self
    }
}
