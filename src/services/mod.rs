//! Services - presence state and the operations around it
//!
//! - `tracker` - Presence state, background polling loop, start/stop lifecycle
//! - `control` - Operator commands (start, stop, reconfigure, rename)
//! - `publisher` - Fixed-cadence snapshot push to streaming subscribers

pub mod control;
pub mod publisher;
pub mod tracker;

// Re-export commonly used types
pub use control::{AppliedConfig, ControlError, ControlSurface, ReconfigureRequest};
pub use publisher::PresencePublisher;
pub use tracker::PresenceTracker;
