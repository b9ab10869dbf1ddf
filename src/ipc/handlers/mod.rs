pub mod core;
pub mod grades;
pub mod registry;
pub mod schema;
pub mod transfer;
