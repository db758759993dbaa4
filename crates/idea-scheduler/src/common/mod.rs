pub mod data_structures;
pub mod error;
pub mod setup;
pub mod table;
pub mod timeutils;
pub mod utils;
pub mod wrapped;

pub use data_structures::{Map, Set};
pub use wrapped::WrappedArcMutex;
