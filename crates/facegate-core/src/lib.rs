pub mod decode;
pub mod errors;
pub mod faces;
