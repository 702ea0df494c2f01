pub mod claim;
pub mod committer;
pub mod offset_window;
pub mod orchestrator;
pub mod retry;
pub mod router;
pub mod worker;
