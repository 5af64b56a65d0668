//! # flowkernel-core - Reactive, persisted, resumable dataflow kernel
//!
//! Build a directed graph of processing nodes, push payloads in, and let the kernel move
//! them through the graph. Every hop is persisted through a [`Repository`], claimed
//! under a [`LockManager`] lease and announced through a [`Messenger`], so a run survives
//! restarts and several runtimes can share the work.
//!
//! ## Features
//!
//! - **Mapping and producing nodes** - one-to-one or batch-to-many transforms
//! - **Exclusive routing** - conditions nodes send each item down one branch
//! - **Fan-out / fan-in** - parallel groups joined with `ALL` or `EITHER` semantics
//! - **Window accumulation** - fold everything one `start` spawned once it is all done
//! - **Suspend / resume** - blocks hold items until someone resumes them
//! - **Termination** - cooperative, checked at every claim and dispatch
//! - **Failure handling** - node and runtime handlers with a retry handle
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Runtime                         │
//! │  node registry · loops · dispatcher · events        │
//! │                                                      │
//! │   ┌─────────────── Node ───────────────┐            │
//! │   │ Subscriber          Publisher      │            │
//! │   │  pre-process         edges         │──► Node    │
//! │   │  process             offer         │            │
//! │   │  execute/after                     │            │
//! │   └────────────────────────────────────┘            │
//! └──────────┬───────────────┬───────────────┬──────────┘
//!            ▼               ▼               ▼
//!       Repository      LockManager      Messenger
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use flowkernel_core::{ParallelMode, Runtime};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::in_memory()?;
//!     let flow = runtime.flow("pricing");
//!
//!     let split = flow.parallel("split", ParallelMode::All);
//!     let net = split.map("net", |v| Ok(json!(v.as_f64().unwrap_or(0.0) * 0.8)));
//!     let tax = split.map("tax", |v| Ok(json!(v.as_f64().unwrap_or(0.0) * 0.2)));
//!     let total = net.join("total", ParallelMode::All, |parts| {
//!         Ok(json!(parts.iter().filter_map(|p| p.as_f64()).sum::<f64>()))
//!     });
//!     tax.to(&total);
//!
//!     let trace = flow.start(vec![json!(100.0)], None).await?;
//!     runtime.wait_settled(&trace, Duration::from_secs(5)).await?;
//!     assert_eq!(flow.values(&trace).await?, vec![json!(100.0)]);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod conditions;
pub mod config;
pub mod edge;
pub mod error;
pub mod flow;
pub mod hooks;
pub mod node;
pub mod parallel;
pub mod publisher;
pub mod runtime;
pub mod subscriber;

pub use block::{Block, BlockKind};
pub use conditions::Routing;
pub use config::{RuntimeConfig, ENV_PREFIX};
pub use edge::{ConvertFn, EdgeOptions, PredicateFn, Subscription};
pub use error::{BoxError, FlowError, Result};
pub use flow::Flow;
pub use hooks::{
    CompletionFn, ErrorHandler, FailureOutcome, FlowEvent, ListenerFn, NodeFailure,
    RetryHandle, SharedError,
};
pub use node::{Branch, MapFn, Node, NodeId, NodeRef, ProduceFn, Role, Transform, TransformFuture};
pub use publisher::Publisher;
pub use runtime::{Runtime, RuntimeBuilder};
pub use subscriber::Subscriber;

pub use flowkernel_store::{
    BatchReady, Context, ContextStatus, InMemoryLockManager, InMemoryMessenger,
    InMemoryRepository, LockGuard, LockKey, LockManager, Messenger, ParallelMode, Repository,
    Session, StoreError, Trace, TraceStatus, TriggerStream, WindowToken, END,
};
