pub mod clock;
pub mod models;
pub mod sleep;
pub mod state;
pub mod stream_frame;
pub mod units;
