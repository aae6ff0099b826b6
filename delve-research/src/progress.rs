//! Fire-and-forget progress events

use crate::types::ResearchProgress;
use tokio::sync::mpsc;
use tracing::trace;

/// Sends one event per finished node without ever waiting on the consumer
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ResearchProgress>,
}

impl ProgressReporter {
    /// Create a reporter and the receiving end for the consumer
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ResearchProgress>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Send an event; full or closed channels drop it
    pub fn report(&self, event: ResearchProgress) {
        if let Err(e) = self.tx.try_send(event) {
            trace!(error = %e, "Progress event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeStatus;
    use uuid::Uuid;

    fn event(completed_nodes: usize) -> ResearchProgress {
        ResearchProgress {
            query_id: Uuid::new_v4(),
            query: "q".to_string(),
            depth: 0,
            status: NodeStatus::Completed,
            completed_nodes,
            total_nodes: 2,
            findings_total: 0,
            documents_total: 0,
        }
    }

    #[tokio::test]
    async fn test_full_and_closed_channels_do_not_block() {
        let (reporter, mut rx) = ProgressReporter::channel(1);
        reporter.report(event(1));
        // Buffer is full; dropped silently
        reporter.report(event(2));

        assert_eq!(rx.recv().await.unwrap().completed_nodes, 1);
        drop(rx);
        reporter.report(event(3));
    }
}
