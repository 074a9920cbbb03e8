extern crate serde;
extern crate toml;

mod util;

pub mod amdor;
pub mod batch;
pub mod configs;
pub mod geometry;
pub mod hardware;
pub mod sim;
pub mod tuner;

pub use util::find_file;
