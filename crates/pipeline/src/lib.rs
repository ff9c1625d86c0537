//! Framecast Render Pipeline
//!
//! Renders a frame range through a session pool and delivers the frames, in
//! order, to one or more output sinks.
//!
//! # Pipeline Architecture
//!
//! ```text
//!            ┌──────────────── SessionPool (≤ parallelism) ───────────────┐
//! info ──▶   │ frame 0 ─┐  frame 1 ─┐  frame 2 ─┐  ...  (any completion)  │
//!            └──────────┼───────────┼───────────┼─────────────────────────┘
//!                       ▼           ▼           ▼
//!                 await 0 ──▶ await 1 ──▶ await 2 ──▶ ...   (ascending)
//!                       │
//!                       ├──▶ StreamEncoderSink ──stdin──▶ ffmpeg ──▶ movie.mp4
//!                       └──▶ FileSequenceSink  ──▶ frame-000000.png ...
//! ```

pub mod pipeline;
pub mod sink;

pub use pipeline::*;
pub use sink::*;
