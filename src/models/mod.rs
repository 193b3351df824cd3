pub mod agent;
pub mod user;
pub mod vehicle;

pub use agent::*;
pub use user::*;
pub use vehicle::*;
