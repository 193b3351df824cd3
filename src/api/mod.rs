pub mod agents;
pub mod error;
pub mod users;
pub mod vehicle_stream;
pub mod vehicles;
