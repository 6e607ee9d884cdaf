pub mod broker;
pub mod codec;
pub mod commit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod metrics;
pub mod producer;
pub mod projects;
pub mod record;
pub mod registry;
pub mod schema_registry;
pub mod supervisor;
pub mod test_utils;
pub mod window;
