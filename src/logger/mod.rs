//! Query logging: one structured entry per answered query, fanned out to
//! injected sinks over bounded channels so the hot path never blocks on a
//! slow sink.

pub mod console_sink;
pub mod types;

pub use self::console_sink::ConsoleLogSink;
pub use self::types::{QueryLogAction, QueryLogEntry, QueryLogSink};

use std::sync::Arc;
use tokio::sync::mpsc;

pub struct QueryLogger {
    sinks: Vec<mpsc::Sender<QueryLogEntry>>,
}

impl QueryLogger {
    pub fn new(sinks: Vec<Box<dyn QueryLogSink>>) -> Arc<Self> {
        let mut senders = Vec::new();
        for sink in sinks {
            let (tx, mut rx) = mpsc::channel::<QueryLogEntry>(1000);
            tokio::spawn(async move {
                while let Some(entry) = rx.recv().await {
                    sink.log(&entry);
                }
            });
            senders.push(tx);
        }
        Arc::new(Self { sinks: senders })
    }

    pub fn log(&self, entry: QueryLogEntry) {
        let len = self.sinks.len();
        for (i, sink) in self.sinks.iter().enumerate() {
            // fire and forget, drop entries instead of blocking the caller
            if i == len - 1 {
                let _ = sink.try_send(entry);
                break;
            }
            let _ = sink.try_send(entry.clone());
        }
    }
}
