pub mod api;
pub mod gtfs;
