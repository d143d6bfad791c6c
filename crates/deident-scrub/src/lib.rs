//! deident scrub — replace identifiers with research ids and drop confidential values.

pub mod scrubber;
pub mod transform;
pub mod verify;

pub use scrubber::{ScrubStats, Scrubber};
pub use transform::transform_columns;
pub use verify::verify_scrubbed;
