//! # httpool
//!
//! **httpool** is an asynchronous HTTP request pool. It submits many concurrent
//! requests to a non-blocking, multi-transfer transport engine (libcurl's
//! multi socket interface being the reference) and drives that engine from an
//! event loop of the caller's choice.
//!
//! The engine only says which sockets it wants watched and when its timer
//! should fire. httpool registers that interest with the selected backend,
//! turns readiness back into engine progress, and runs each request's
//! callback exactly once when the engine reports it finished:
//!
//! - **Raw `epoll`**, which cannot attach a callback to a descriptor, so
//!   sockets and the timer live in nested wait groups
//! - **`mio`**, with one token per socket
//! - **A service event loop** with one callback per event source, which can be
//!   shared with the rest of the application
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use httpool::transport::curl::CurlEngine;
//! use httpool::{BackendKind, Disposal, Pool};
//! use std::time::Duration;
//!
//! let mut pool = Pool::new(CurlEngine::new()?, BackendKind::RawReactor, 0)?;
//!
//! for url in ["https://example.com/", "https://example.org/"] {
//!     pool.send_get(url, (), |handle| {
//!         println!("{} -> {} ({} ms)", handle.url(), handle.status(), handle.elapsed_ms());
//!         Disposal::Free
//!     })?;
//! }
//!
//! pool.run_until_idle(Duration::from_secs(1))?;
//! ```
//!
//! ## Modules
//!
//! - [`reactor`]: The backend contract and the three backends
//! - [`service`]: The service event loop
//! - [`transport`]: The engine contract, the adapter and the libcurl engine
//!
//! ## Features
//!
//! - `curl`: enables [`transport::curl::CurlEngine`]

mod dispatch;
mod error;
mod handle;
mod pool;
mod sys;
mod utils;

pub mod reactor;
pub mod service;
pub mod transport;

pub use error::{
    DriveError, Error, RegistrationError, RegistrationOp, RunError, SubmitError, TransferError,
};
pub use handle::{Callback, Disposal, HandleId, RequestHandle, STATUS_ABORTED, STATUS_PENDING};
pub use pool::{ExecutionMode, Pool, PoolBuilder};
pub use reactor::BackendKind;
pub use transport::{Request, RequestOptions};
