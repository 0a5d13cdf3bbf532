pub mod error;
pub mod health;
pub mod jobs;
pub mod schedules;
