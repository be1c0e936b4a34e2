//! Background workers
//!
//! This module contains the long-running parts that receive published
//! streams and persist them.

use async_trait::async_trait;

pub mod receiver;
pub mod save_stream;

/// Trait for workers that need graceful shutdown.
#[async_trait]
pub trait WorkerClose {
    /// Close and clean up worker resources.
    async fn close(&self);
}
