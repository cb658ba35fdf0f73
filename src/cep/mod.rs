pub mod flink;
pub mod handlers;
pub mod reconciler;
pub mod sink;
