pub mod audit;
pub mod config;
pub mod deadline;
pub mod diff;
pub mod driver;
pub mod map_store;
pub mod paths;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod source;
pub mod tree;
pub mod util;
