pub mod consensus;
pub mod core;
pub mod job;
pub mod job_manager;
pub mod orchestration;
pub mod params;
pub mod registry;
