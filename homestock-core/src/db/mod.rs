pub mod schema;
pub mod operations;
pub mod downloads;

pub use schema::*;
pub use operations::*;
pub use downloads::*;
