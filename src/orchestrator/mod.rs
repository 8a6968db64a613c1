pub mod app;

pub use app::{App, MetricsSnapshot, StartQuizRequest};
