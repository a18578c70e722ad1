pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FlowlogError, Result};
pub use types::{
    AccountDescriptor, DATETIME_FORMAT, ProgressRecord, Timestamp, format_timestamp,
    parse_timestamp,
};
