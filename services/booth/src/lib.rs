//! Booth Service
//!
//! Capture control and gallery backend for event photo booths. Several
//! tablets watch the same camera trigger; a distributed lock over a shared
//! document store makes sure exactly one of them counts down, captures and
//! uploads a photo each time the operator fires the trigger.
//!
//! ## Features
//!
//! - **Resource Lock**: single-owner lock built on versioned compare-and-swap
//!   transactions, re-entrant for the owner and released on shutdown
//! - **Capture State Machine**: Locked / Waiting / CameraReady / Capturing,
//!   driven by live lock and trigger subscriptions
//! - **Capture Engine**: countdown with a re-entry guard, centered
//!   crop-to-fill and lossless PNG encoding
//! - **Gallery**: raw uploads, blob-to-record synchronisation with download
//!   tokens, paginated listing and per-item batch delete
//!
//! ## Architecture
//!
//! ```text
//!  Operator console            Document store (Postgres / memory)
//! ┌──────────────┐  PUT       ┌───────────────────────────────┐
//! │ booth-server │──────────▶ │ camera/trigger  camera/resource│
//! │  (HTTP API)  │◀────────── │ images/*  theme/*  metadata/*  │
//! └──────────────┘            └───────────────────────────────┘
//!        │                         ▲ watch          ▲ CAS
//!        ▼                         │                │
//! ┌──────────────┐            ┌──────────────┐  ┌──────────────┐
//! │ Gallery      │◀───────────│ Capture      │──│ Resource     │
//! │ (blob store) │  upload    │ Controller   │  │ Lock         │
//! └──────────────┘            └──────────────┘  └──────────────┘
//!                                    │
//!                                    ▼
//!                             ┌──────────────┐
//!                             │ Capture      │
//!                             │ Engine       │
//!                             └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod bootstrap;
pub mod capture;
pub mod config;
pub mod document_store;
pub mod error;
pub mod gallery;
pub mod identity;
pub mod pg_document_store;
pub mod resource_lock;
pub mod s3_blob_store;
pub mod state_machine;
pub mod themes;
pub mod trigger;

pub use api::{create_router, start_api_server, AppState};
pub use blob_store::{BlobStore, InMemoryBlobStore};
pub use capture::{CaptureEngine, EncodedImage, StillImageSource};
pub use config::Config;
pub use document_store::{DocumentStore, InMemoryDocumentStore};
pub use error::{BoothError, Result};
pub use gallery::Gallery;
pub use identity::{DeviceIdentityProvider, FileKeyValueStore};
pub use resource_lock::{LockRecord, LockResult, ResourceLock};
pub use state_machine::{CaptureController, CaptureSink, CaptureState, CaptureStateMachine};
pub use themes::ThemeService;
pub use trigger::{TriggerChannel, TriggerRecord, TriggerUpdate};
