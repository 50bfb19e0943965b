pub mod dao;
pub mod error;
pub mod model;

pub use dao::*;
pub use error::*;
pub use model::*;
