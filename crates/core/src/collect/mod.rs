pub mod paginator;
pub mod retry;
