pub mod device;
pub mod device_group;
pub mod level;
pub mod status_event;
pub mod supervisor_state;
