pub mod error;
pub mod modeling;
pub mod util;

pub use crate::error::Error;
