pub mod agent;
pub mod dispatcher;
pub mod errors;
pub mod models;
pub mod providers;
pub mod streaming;
pub mod token_counter;
pub mod tool;
pub mod usage;
