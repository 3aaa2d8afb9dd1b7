//! Link status subjects of watched functions.
//!
//! Only the subscription contract exists; no notification is delivered yet.

use tracing::debug;

/// Follows the link state of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkWatcher {
    if_name: String,
}

impl LinkWatcher {
    pub fn new(if_name: impl Into<String>) -> Self {
        Self {
            if_name: if_name.into(),
        }
    }

    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    pub fn subscribe(&self) {
        debug!(if_name = %self.if_name, "link watch subscribed");
    }
}
