pub mod config;
pub mod entity;
pub mod queue;
pub mod run;
pub mod status;
pub mod sync;
