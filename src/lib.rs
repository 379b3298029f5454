pub mod checkpoint;
pub mod config;
pub mod error;
pub mod inference;
pub mod net;
pub mod preprocess;
pub mod server;
pub mod state;
pub mod torch;
pub mod util;
