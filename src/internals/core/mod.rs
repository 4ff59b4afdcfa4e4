pub mod dispatcher;
pub mod ports;
pub mod supervisor;
