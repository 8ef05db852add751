//! HTTP inspector for tasklog.
//!
//! This crate adds a `.with_inspector(port)` method to `TaskQueueBuilder`
//! that serves the state of the completion ledger.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tasklog::{LogBroker, MemoryLogStore, TaskQueueBuilder};
//! use tasklog_inspector::TaskQueueInspectorExt;
//!
//! let queue = TaskQueueBuilder::new(LogBroker::new(MemoryLogStore::new()))
//!     .handler(my_handler)
//!     .with_inspector(3000)
//!     .build();
//!
//! // curl http://localhost:3000/api/ledger
//! ```
//!
//! # Endpoints
//!
//! - `GET /healthz` answers `ok`
//! - `GET /api/ledger` lists every ledger queue with its pending count and head entry

mod ext;
mod server;

pub use ext::TaskQueueInspectorExt;
pub use server::{create_router, run_server, InspectorState};
