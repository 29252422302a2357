pub mod environment;
pub mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config};
