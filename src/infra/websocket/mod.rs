pub mod connection;
pub mod manager;
pub mod messages;
pub mod presence;
pub mod router;

pub use connection::*;
pub use manager::*;
pub use messages::*;
pub use presence::*;
