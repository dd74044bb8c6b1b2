//! The self-correcting answer pipeline.
//!
//! Each stage is a small type over one model capability; [`Pipeline`] wires
//! them into the correction loop.

pub mod controller;
pub mod generator;
pub mod reranker;
pub mod rewriter;
pub mod state;
pub mod validator;

pub use controller::{Capabilities, Pipeline};
