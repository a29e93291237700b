//! Operator notifications for rejections and breaker events

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Critical,
}

pub trait Notifier {
    fn notify(&mut self, level: NoticeLevel, message: &str);
}

/// Routes notices into the tracing pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => info!(target: "notice", "{}", message),
            NoticeLevel::Warning => warn!(target: "notice", "{}", message),
            NoticeLevel::Critical => error!(target: "notice", "{}", message),
        }
    }
}
