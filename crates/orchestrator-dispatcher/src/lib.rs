//! Schedule Dispatcher (§4.7): primary-instance election over the
//! `scheduler.primary` lock, a tick loop that claims due schedules and
//! dispatches their action, missed-fire policy resolution, event-triggered
//! fires, and crash recovery of orphaned `claimed` ScheduleRuns.
//!
//! - [`dispatcher`] — [`Dispatcher`], the public handle: `run`, `recover`.
//! - [`missed`] — missed-fire policy resolution (`coalesce`/`fire_all`/
//!   `skip_missed`), used by the dispatcher and unit-tested standalone.
//! - [`error`] — [`DispatcherError`], the dispatcher's failure taxonomy.

pub mod error;
pub mod missed;

mod dispatcher;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{DispatcherError, DispatcherResult};
