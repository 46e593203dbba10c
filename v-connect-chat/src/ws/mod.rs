pub mod frames;
pub mod server;
pub mod session;

pub use session::handle_connection;
