pub mod cli;
pub mod errors;
pub mod response;
pub mod routes;
pub mod settings;
pub mod telemetry;
