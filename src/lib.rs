pub mod config;
pub mod gateway;
pub mod util;
pub mod wire;
pub mod test_util;
