pub mod api;
pub mod jwt;
