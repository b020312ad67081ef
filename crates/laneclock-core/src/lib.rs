pub mod errors;
pub mod ids;
pub mod roles;
pub mod timer;

pub use errors::{RoleError, TimerError};
pub use ids::ConnectionId;
pub use roles::{Lane, Role, RoleRegistry, LANE_COUNT};
pub use timer::{Clock, ElapsedSource, ManualClock, StopOutcome, SystemClock, TimerSession};
