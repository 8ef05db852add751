//! Extension trait for TaskQueueBuilder.

use std::sync::Arc;

use tasklog::TaskQueueBuilder;
use tracing::error;

use crate::server::{run_server, InspectorState};

/// Extension trait that adds the inspector to TaskQueueBuilder.
pub trait TaskQueueInspectorExt: Sized {
    /// Serve the ledger of the built queue on the given port.
    ///
    /// The server runs on a background task for the life of the runtime.
    fn with_inspector(self, port: u16) -> Self;
}

impl TaskQueueInspectorExt for TaskQueueBuilder {
    fn with_inspector(self, port: u16) -> Self {
        let state = Arc::new(InspectorState {
            ledger: self.ledger(),
        });

        tokio::spawn(async move {
            if let Err(e) = run_server(state, port).await {
                error!(port, error = %e, "Inspector server stopped");
            }
        });

        self
    }
}
