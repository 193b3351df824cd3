mod service;

pub use service::DatabaseService;
