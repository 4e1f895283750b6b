//! Click and visit analytics: request capture, enrichment (user agent,
//! geo, attribution), session windows and the recording pipeline.
//!
//! Recording stays off the redirect response path; handlers capture
//! synchronously and persist on a detached task.

pub mod geoip;
pub mod ip_extractor;
pub mod query;
pub mod recorder;
pub mod session;
pub mod ua;

pub use geoip::GeoIpService;
pub use ip_extractor::extract_client_ip;
pub use recorder::EventCapture;
pub use session::{SessionVerdict, DEFAULT_SESSION_TIMEOUT_SECS};
