use crate::config::LoggingConfig;
use crate::logger::types::{QueryLogAction, QueryLogEntry, QueryLogSink};
use tracing::info;

pub struct ConsoleLogSink {
    config: LoggingConfig,
}

impl ConsoleLogSink {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }
}

impl QueryLogSink for ConsoleLogSink {
    fn log(&self, entry: &QueryLogEntry) {
        if !self.config.enable {
            return;
        }

        let should_log = match entry.action {
            QueryLogAction::Blocked => self.config.log_blocked,
            _ => self.config.log_all_queries,
        };
        if !should_log {
            return;
        }

        if self.config.format == "json" {
            info!(
                target: "dns_query",
                client = %entry.client_ip,
                consumer = %entry.consumer,
                domain = %entry.domain,
                r#type = %entry.query_type,
                action = ?entry.action,
                list = ?entry.list,
                resolver = ?entry.resolver,
                source = ?entry.source,
                lat = %entry.latency_ms
            );
        } else {
            let action_str = match &entry.action {
                QueryLogAction::Blocked => match &entry.list {
                    Some(list) => format!("blocked by list {}", list),
                    None => "blocked".to_string(),
                },
                QueryLogAction::Allowed => match &entry.source {
                    Some(source) => format!("allowed, fetched from {}", source),
                    None => "allowed".to_string(),
                },
                QueryLogAction::Cached => "fetched from cache".to_string(),
                QueryLogAction::Forwarded => match &entry.source {
                    Some(source) => format!("fetched from {}", source),
                    None => "fetched from upstream".to_string(),
                },
                QueryLogAction::Failed => "failed, served SERVFAIL".to_string(),
            };

            info!(
                "[{}] {} ({}) {} -> {} [{}ms]",
                entry.query_type,
                entry.client_ip,
                entry.consumer,
                entry.domain,
                action_str,
                entry.latency_ms
            );
        }
    }
}
