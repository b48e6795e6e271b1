pub mod autonomy;
pub mod config;
pub mod database;
pub mod directives;
pub mod importer;
pub mod presence;
pub mod runtime;
pub mod server;
