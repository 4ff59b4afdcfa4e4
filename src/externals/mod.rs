pub mod console;
pub mod event_logging;
pub mod ssc;
