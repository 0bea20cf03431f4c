//! # Diploma - Template Composition & Rendering Engine
//!
//! Diploma turns a template of fields (a background, free images, text
//! with `${...}` tokens) into rendered certificates, one per recipient of
//! a tournament. It provides:
//!
//! - **Model**: field records, stable field keys, persisted placements
//! - **Substitution**: `${tournament.*}` / `${player.*}` token expansion
//! - **Loading**: data-URI images and first-page PDF backgrounds, decoded off the async runtime
//! - **Compositing**: idempotent reconciliation of a template onto a drawing surface
//! - **Targets**: the edit canvas, per-recipient thumbnails and full-size exports
//!
//! ## Quick Start
//!
//! ```no_run
//! use diploma::{
//!     config::EngineConfig,
//!     recipient::Tournament,
//!     session::EditSession,
//!     store::FileTemplateStore,
//!     target::RenderTargetManager,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), diploma::DiplomaError> {
//! let store = Arc::new(FileTemplateStore::new("templates"));
//! let manager = RenderTargetManager::new(EngineConfig::default());
//! let session = EditSession::open(store, "spring-open", manager).await;
//!
//! let tournament: Tournament = serde_json::from_str(&std::fs::read_to_string("tournament.json")?)?;
//! for outcome in session.export_all(&tournament, &tournament.recipients()).await {
//!     let artifact = outcome.result?;
//!     artifact.write_to("out".as_ref())?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`model`] | Field records, keys, placements, registry |
//! | [`substitute`] | Token expansion |
//! | [`loader`] | Payload decoding and the decode cache |
//! | [`surface`] | Drawing surfaces and painting |
//! | [`compositor`] | Template-to-surface reconciliation |
//! | [`target`] | Render targets, thumbnails and exports |
//! | [`session`] | Edit session |
//! | [`store`] | Template persistence |
//! | [`recipient`] | Tournaments and recipients |
//! | [`error`] | Error types |

pub mod compositor;
pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod model;
pub mod recipient;
pub mod session;
pub mod store;
pub mod substitute;
pub mod surface;
pub mod target;

// Re-exports for convenience
pub use compositor::{ApplyReport, Compositor, FieldChange};
pub use config::EngineConfig;
pub use error::{DiplomaError, FieldError};
pub use model::{FieldKey, FieldKind, FieldMap, FieldRecord, Template};
pub use session::EditSession;
pub use target::RenderTargetManager;
