pub mod cli;
pub mod resource;

pub use cli::*;
pub use resource::*;
