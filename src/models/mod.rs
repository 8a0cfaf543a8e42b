pub mod config;
pub mod token;
pub mod user;

pub use config::*;
pub use token::*;
pub use user::*;
