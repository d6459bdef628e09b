pub mod command;

pub use command::{CommandQueue, SqliteCommandQueue};
