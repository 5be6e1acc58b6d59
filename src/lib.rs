//! K2Filter - A content-filtering rule engine.
//!
//! This crate maintains ad-blocking and tracking-protection rule lists,
//! compiles them into memory-mapped indexes and answers whether a request
//! or a page load should be blocked.
//!
//! # Features
//!
//! - **Two rule groups**: Tracking and ad-blocking, each enabled on its own
//! - **Rule sources**: Lists fetched from URLs or read from local files,
//!   refreshed on the interval the list asks for
//! - **Compiled indexes**: One binary index per group, rebuilt only when the
//!   combined rules change, swapped in without blocking readers
//! - **Exception lists**: Per-group allow and process lists with suffix matching
//! - **Blocked-URL reporting**: Per-domain counters and per-tab blocked URLs
//!   with navigation rollback
//! - **Durable state**: Debounced atomic JSON writes with a backup file and
//!   schema migrations
//!
//! # Quick Start
//!
//! ```ignore
//! use k2filter::{Request, ResourceKind, RuleGroup, RuleServiceBuilder, RuleServiceConfig};
//! use url::Url;
//!
//! let config = RuleServiceConfig::with_data_dir("/tmp/k2filter");
//! let mut service = RuleServiceBuilder::new(config).load()?.wait();
//!
//! let list = Url::parse("https://easylist.to/easylist/easylist.txt")?;
//! service.add_rules_from_url(RuleGroup::AdBlocking, &list)?;
//! service.run_until_idle();
//!
//! let request = Request::new(
//!     Url::parse("https://ads.example.com/banner.js")?,
//!     Some(Url::parse("https://news.example.org/")?),
//!     ResourceKind::Script,
//! );
//! if service.should_block_request(&request) {
//!     println!("blocked");
//! }
//! service.shutdown();
//! ```
//!
//! # Threading
//!
//! [`RuleService`] is single-threaded. Fetches, reads of saved rules, index
//! builds and state writes run on worker threads; their results are applied
//! by [`RuleService::run_pending`]. Compiled indexes are shared through
//! [`IndexHandle`], which any thread may query.

mod error;
mod group;

pub mod config;
pub mod exceptions;
pub mod fetch;
pub mod index;
pub mod index_manager;
pub mod known_sources;
pub mod observer;
pub mod parser;
pub mod presets;
pub mod reporter;
pub mod sequence;
pub mod service;
pub mod source;
pub mod source_handler;
pub mod storage;

// Re-export core types
pub use error::{Error, Result, SourceError};
pub use group::{PerGroup, RuleGroup};

// Re-export the engine
pub use config::RuleServiceConfig;
pub use service::{CosmeticFilter, PendingRuleService, Request, RuleService, RuleServiceBuilder};

// Re-export the types its API speaks in
pub use exceptions::ExceptionsList;
pub use index::{ActivationFlags, IndexHandle, RequestMatch, ResourceKind};
pub use index_manager::IndexStatus;
pub use known_sources::KnownRuleSourcesHandler;
pub use observer::{EventKind, Observer, ObserverId, RuleServiceEvent};
pub use reporter::{FrameContext, NavigationId, TabId};
pub use source::{FetchResult, KnownRuleSource, RuleSource, SourceId};
