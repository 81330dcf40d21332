//! Query functions, grouped by table. Each module owns the SQL for its
//! slice of the schema; callers compose them into the larger contracts
//! (`CreateJob`, `TransitionSubTask`, ...) documented on the functions
//! themselves.

pub mod events;
pub mod integrity_reports;
pub mod jobs;
pub mod notification_messages;
pub mod platform_health;
pub mod platform_tasks;
