pub mod agent;
pub mod client;
pub mod errors;
pub mod models;
pub mod prompt_template;
pub mod protocol;
pub mod providers;
pub mod sse;
pub mod structured;
pub mod tools;
pub mod ui;
