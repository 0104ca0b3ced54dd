pub mod counts;
pub mod service;
pub mod tags;
