//! Nullroute - a local-VPN DNS interception engine.
//!
//! The engine sits behind a tunnel interface provided by the host. The
//! tunnel advertises synthetic DNS servers; every query sent to them is
//! read back from the tunnel, classified, and either answered locally
//! (blocked or redirected names) or forwarded to the real server behind the
//! synthetic address. Answers are written back so they appear to come from
//! the address the application queried.
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`network`]: IP/UDP packet codec and the tunnel device
//! - [`dns`]: Classification, server virtualization, upstream resolution
//!   and the packet proxy
//! - [`cache`]: Classification cache
//! - [`vpn`]: Sessions, the event loop, reconnection and health checks
//! - [`metrics`]: Prometheus exporter
//! - [`error`]: Error types
//!
//! # Example
//!
//! Classifiers are plain values and can be exercised without a tunnel:
//!
//! ```rust
//! use nullroute::dns::{Classification, Classifier, HostRules};
//! use nullroute::cache::CachedClassifier;
//!
//! let rules = HostRules::new(["*.ads.example"], ["ok.ads.example"], [("home.lan", "192.168.1.2")]);
//! let classifier = CachedClassifier::new(rules);
//!
//! assert_eq!(classifier.classify("tracker.ads.example"), Classification::Blocked);
//! assert_eq!(classifier.classify("ok.ads.example"), Classification::Allowed);
//! assert_eq!(
//!     classifier.classify("home.lan"),
//!     Classification::Redirected("192.168.1.2".into())
//! );
//! ```

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod network;
pub mod vpn;

pub use config::EngineConfig;
pub use error::{Error, Result};
