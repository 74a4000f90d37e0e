pub mod client;
pub mod config;
pub mod controller;
pub mod errors;
pub mod executor;
pub mod ratecounter;
pub mod report;
pub mod requests;
pub mod result;
pub mod script;
pub mod utils;
pub mod values;
pub mod worker;
