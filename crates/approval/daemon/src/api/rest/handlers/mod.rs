//! API request handlers

mod audit;
mod health;
mod identity;
mod instances;
mod users;
mod workflows;

pub use audit::*;
pub use health::*;
pub use identity::*;
pub use instances::*;
pub use users::*;
pub use workflows::*;
