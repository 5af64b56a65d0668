//! # flowkernel-store - Data model and collaborator contracts
//!
//! This crate holds everything the `flowkernel-core` execution kernel persists or
//! coordinates through:
//!
//! - **Data model** - [`Context`] (one in-flight token), [`Trace`] (one run),
//!   [`Session`] (one external `start` call) and [`WindowToken`] (cohort completion)
//! - **Contracts** - [`Repository`], [`LockManager`] and [`Messenger`], the only shared
//!   mutable resources the kernel touches
//! - **Reference backends** - [`InMemoryRepository`], [`InMemoryLockManager`] and
//!   [`InMemoryMessenger`] for development and tests
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        flowkernel-core (execution kernel)     │
//! │  publisher · subscriber · runtime · blocks    │
//! └──────────────┬───────────────┬────────────────┘
//!                │               │
//!      Repository│    LockManager│ Messenger
//!                ▼               ▼
//! ┌───────────────────────────────────────────────┐
//! │   Backend (in-memory here; SQL / Redis /      │
//! │   broker implementations supplied by users)   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use flowkernel_store::{
//!     Context, ContextStatus, InMemoryRepository, Repository, Session,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = InMemoryRepository::new();
//!     let ctx = Context::new("orders", "validate", json!({"id": 7}), &Session::new())
//!         .with_status(ContextStatus::Pending);
//!
//!     repo.save_contexts(&[ctx.clone()]).await?;
//!     let found = repo
//!         .find_contexts("orders", &["validate".to_string()], ContextStatus::Pending)
//!         .await?;
//!     assert_eq!(found.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod memory;
pub mod trace;
pub mod traits;
pub mod window;

pub use context::{Context, ContextStatus, ParallelMode, Session, END};
pub use error::{Result, StoreError};
pub use memory::{InMemoryLockManager, InMemoryMessenger, InMemoryRepository};
pub use trace::{Trace, TraceStatus};
pub use traits::{
    BatchReady, LockGuard, LockKey, LockManager, Messenger, Repository, TriggerStream,
};
pub use window::WindowToken;
