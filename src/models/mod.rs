pub mod agent;
pub mod assignment;
pub mod order;
