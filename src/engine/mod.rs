pub mod broker;
pub mod watch;
