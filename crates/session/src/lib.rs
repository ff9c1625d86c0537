//! Framecast Render Sessions
//!
//! A render session owns one instance of an external rendering engine with
//! a document loaded in it. It exposes two operations: reading the movie
//! metadata (polled once, then cached) and capturing a numbered frame.
//!
//! # Layers
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │             RenderSession              │
//! │   info() ── cached MovieInfo           │
//! │   render_frame(i) ── seek + capture    │
//! └──────────────────┬─────────────────────┘
//!                    │ page protocol (window.__framecast)
//! ┌──────────────────▼─────────────────────┐
//! │   RenderEngine / EngineInstance        │
//! │   DriverEngine  ── JSON lines ──▶ driver process
//! └────────────────────────────────────────┘
//! ```

pub mod driver;
pub mod engine;
pub mod movie;
pub mod page;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use driver::DriverEngine;
pub use engine::*;
pub use movie::*;
pub use session::*;
