pub mod extractor;
pub mod memory;
pub mod orchestrator;
pub mod task;
