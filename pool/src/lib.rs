//! a multiplexed http connection pool
//!
//! Logical request/response streams are handed out from a small number of physical connections
//! negotiated to a protocol with stream multiplexing. Transport itself is abstracted behind the
//! traits of [transport] module.
//!
//! # Quick Start
//! ```no_run
//! use xitca_pool::{error::Error, transport::Provider, Collect, PoolBuilder, RequestBody};
//!
//! async fn get<P: Provider>(provider: P) -> Result<(), Error> {
//!     // bound the pool to 4 physical connections.
//!     let executor = PoolBuilder::new().set_max_connections(4).finish(provider);
//!
//!     let mut req = http::Request::new(RequestBody::none());
//!     *req.uri_mut() = http::Uri::from_static("https://www.rust-lang.org/");
//!
//!     // collect the whole response into memory.
//!     let res = executor.send(req, Collect::<1024>::new()).await?;
//!     println!("{}", String::from_utf8_lossy(res.body()));
//!
//!     executor.pool().close().await
//! }
//! ```
//!
//! # Composable
//! - [Pool] can be used alone for acquiring and releasing raw streams.
//! - [LimitedProvider] and [AcquireQueue] add admission policies on top of it.
//! - [RequestExecutor] drives exchanges and reports result through [ExecutionOutcome].

#![forbid(unsafe_code)]

mod body;
mod builder;
mod config;
mod executor;
mod outcome;
mod policy;
mod pool;
mod record;
mod response;
mod timeout;

#[cfg(test)]
mod test_util;

pub mod error;
pub mod transport;

pub use self::body::{BodyError, BodySize, LimitedBody, RequestBody};
pub use self::builder::PoolBuilder;
pub use self::config::Config;
pub use self::executor::{FullDuplex, RequestExecutor, ResponseHandler};
pub use self::outcome::{ExecutionOutcome, OutputFuture};
pub use self::policy::{AcquireQueue, LimitedProvider};
pub use self::pool::{Pool, PoolStats, PooledStream};
pub use self::record::{AbortHandle, ConnectionStats, ExchangeContext};
pub use self::response::{Collect, Trailers};
pub use self::timeout::TimeoutConfig;

// re-export http crate.
pub use http;

// re-export bytes crate.
pub use bytes;
