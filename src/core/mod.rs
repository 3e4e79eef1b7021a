pub mod event_bus;
pub mod poller;
pub mod reconciler;
pub mod scheduler;
pub mod segmenter;
pub mod service;
