mod apply;
pub mod diff;
pub mod engine;
pub mod folders;
mod full;
mod incremental;
pub mod progress;
pub mod quota;
pub mod retry;
pub mod safepath;
pub mod source;
pub mod writer;
