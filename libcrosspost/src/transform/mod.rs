//! Offloaded file normalization
//!
//! CPU-heavy image work (decode, resize, re-encode) runs in transform
//! workers so the posting control flow never blocks on it.

pub mod engine;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use engine::TransformEngine;
pub use pool::{TransformPoolConfig, TransformWorkerPool};
pub use protocol::{TransformRequest, TransformResponse, TransformedFile};
pub use worker::{TransformWorker, WorkerBackend};
