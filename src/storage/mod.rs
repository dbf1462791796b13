pub mod dedup;
pub mod failures;
pub mod saver;
