pub mod device;
pub mod event;
pub mod link;
pub mod session;

pub use device::{Device, NewDevice};
pub use event::{EventKind, EventRecord, GeoLocation, NewEvent, RecordOutcome, UtmParams};
pub use link::{CreateLinkRequest, Link, RedirectMode};
pub use session::Session;
