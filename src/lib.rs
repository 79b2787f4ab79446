//! Cron-driven deferred task scheduler built on a hashed timing wheel.
//!
//! [`CronExpression`] parses Quartz-style six/seven-field expressions and
//! answers "next valid instant after t". [`HashedWheelTimer`] dispatches
//! deferred work from a power-of-two bucket ring ticked by a dedicated
//! thread, with O(1) insertion and cancellation. [`Scheduler`] glues the two
//! together and re-arms every job after it fires.
//!
//! ```no_run
//! use std::time::Duration;
//! use cronwheel::Scheduler;
//!
//! let scheduler = Scheduler::new(Duration::from_millis(100), 512);
//! scheduler
//!     .add("heartbeat", "0/5 * * * * ?", || println!("tick"))
//!     .unwrap();
//! // ...
//! let unfired = scheduler.shutdown();
//! assert_eq!(unfired, vec!["heartbeat".to_string()]);
//! ```

pub mod config;
pub mod cron;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod wheel;

pub use cron::CronExpression;
pub use error::{AddError, CronField, CronParseError, SubmitError};
pub use scheduler::Scheduler;
pub use wheel::{Executor, HashedWheelTimer, TimerTask, Timeout};
