pub mod blocker;
pub mod challenge;
pub mod chromium;
pub mod engine;
pub mod persona;
pub mod pool;
