//! Image Detection Service
//!
//! Accepts image uploads from authenticated users, runs an external object
//! detector over each one, and keeps a per-user catalog of the results.
//! Users can list, search, rename, delete and download their images, one at
//! a time or as a zip archive.
//!
//! ## Features
//!
//! - **Detection on upload**: Every upload is stored, recorded as pending and
//!   handed to a YOLO-style analyzer script; its JSON output is grouped by
//!   class name and the annotated image is kept alongside the original
//! - **Owner-scoped catalog**: Every read and write is limited to the
//!   records the caller created
//! - **Listing filters**: Case-insensitive search, status, last-24-hours and
//!   sorting by creation time or name
//! - **Batch export**: Any selection of records as one zip archive
//! - **Stuck-record repair**: A reconciler fails uploads left pending by a
//!   crash or lost update
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API                 Image Service               PostgreSQL
//! ┌──────────────┐         ┌──────────────┐          ┌──────────────┐
//! │ /images      │────────▶│ upload,      │─────────▶│ images       │
//! │ /images/:id  │         │ ownership,   │          └──────────────┘
//! │ /download    │         │ delete,      │                 ▲
//! └──────────────┘         │ export       │                 │
//!                          └──────────────┘          ┌──────────────┐
//!                             │        │             │ Reconciler   │
//!                             ▼        ▼             └──────────────┘
//!                    ┌──────────────┐ ┌──────────────┐
//!                    │ File Store   │ │ Analyzer     │
//!                    │ public/images│ │ detect.py    │
//!                    └──────────────┘ │ runs/detect/ │
//!                                     └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod detector;
pub mod error;
pub mod export;
pub mod file_store;
pub mod model;
pub mod pg_store;
pub mod query;
pub mod reconcile;
pub mod results;
pub mod service;
pub mod store;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use detector::{Analyzer, AnalyzerRun, YoloAnalyzer};
pub use error::{DetectionError, ImageError, StoreError};
pub use export::Archive;
pub use file_store::FileStore;
pub use model::{BoundingBox, DetectedObjectGroup, ImageRecord, ImageStatus, OwnerId};
pub use pg_store::PgImageStore;
pub use query::{ImageFilter, ListParams};
pub use reconcile::Reconciler;
pub use service::{Download, ImageService, Upload};
pub use store::{ImageStore, MemoryImageStore};
