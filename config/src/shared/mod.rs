mod base;
mod batch;
mod connection;
mod reindex;
mod retry;

pub use base::*;
pub use batch::*;
pub use connection::*;
pub use reindex::*;
pub use retry::*;
