pub mod buffer_pool;
pub mod decimal;

pub use buffer_pool::{reserve_key_capacity, with_key_buffer};
pub use decimal::DecimalCounter;
