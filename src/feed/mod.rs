mod filter;
mod live;

pub use filter::VehicleFilter;
pub use live::{FeedError, FeedWriter, LiveFeed, VehicleLookup};
