//! Framecast Session Pool
//!
//! Arbitrates exclusive access to a bounded set of render sessions. The pool
//! grows lazily up to its bound, waits on a permit semaphore when saturated,
//! and replaces sessions whose tasks fail.
//!
//! ```text
//!  submit(task) ──▶ permit (≤ max) ──▶ available session? ──yes──▶ run task
//!                                          │ no                     │
//!                                          ▼                  ok ◀──┴──▶ err
//!                                    open new session       release    close + discard
//! ```

pub mod pool;

pub use pool::*;
