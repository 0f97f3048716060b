// Module definitions for the handler categories

pub mod data_transformation;
pub mod http;
pub mod uuid;
pub mod validation;

pub use data_transformation::*;
pub use http::*;
pub use uuid::*;
pub use validation::*;
