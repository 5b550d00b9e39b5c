//! Fuzzing harnesses for nicpipe.
//!
//! Each model drives the real queue, notification and framing code on heap
//! memory and checks it against a plain `VecDeque` reference.

pub mod notification_model;
pub mod pipe_model;
pub mod queue_model;
