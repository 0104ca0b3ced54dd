pub mod aggregate;
pub mod pipeline;
