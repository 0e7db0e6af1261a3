pub mod error;
pub mod time;

pub use error::{Result, StoreError, UpdateError};
pub use time::{Clock, ManualClock, SystemClock};
