pub mod api;
pub mod cloud;
pub mod db;
pub mod geocoder;
pub mod stream;
