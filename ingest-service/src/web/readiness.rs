//! One-shot readiness gate.
//!
//! Requests are refused until the topology has been established and a
//! publisher installed. The gate never closes again once opened.

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::publisher::Publisher;

#[derive(Clone, Default)]
pub struct Readiness {
    publisher: Arc<OnceLock<Publisher>>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate. Returns false if it was already open.
    pub fn mark_ready(&self, publisher: Publisher) -> bool {
        match self.publisher.set(publisher) {
            Ok(()) => {
                info!("service_ready");
                true
            }
            Err(_) => {
                warn!("service_already_ready");
                false
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.publisher.get().is_some()
    }

    /// The installed publisher, if startup has completed.
    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.get()
    }
}
