pub mod mocks;
pub mod utils;
