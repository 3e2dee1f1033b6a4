//! Background job queue (§4.6: "asynchronously enqueue an 'archival' job",
//! "enqueue a 'pending_delivery' background job").
//!
//! The spec calls for fire-and-forget follow-up work off the send path —
//! it must not hold up the `sent_ack`/`deliver` hand-off. `JobQueue` is the
//! narrow trait `Router` depends on so that follow-up work can be swapped
//! for a real queue (SQS/NATS/etc) in a deployment without touching
//! dispatch logic; [`InProcessJobQueue`] is the in-process worker used
//! here, the same "trait seam, tokio-task implementation" shape the
//! teacher uses for anything it doesn't want to pull an external broker in
//! for just to satisfy a narrow internal need.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use umbra_db::repository::audit;
use umbra_db::Database;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub enum Job {
    /// Analytics/retention follow-up for a just-persisted message
    /// (§4.6 step 5, runs regardless of delivery route).
    Archive { message_id: Uuid },
    /// Recorded when a message is queued to an offline recipient's inbox;
    /// stands in for handing off to whatever external push-notification
    /// worker a deployment wires up (out of scope, §1).
    PendingDelivery { user_id: Uuid, message_id: Uuid },
}

/// Enqueue is synchronous and non-blocking — callers on the hot send path
/// never await storage for these.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job);
}

/// Runs enqueued jobs on a single background task fed by an unbounded
/// channel, so a burst of sends never blocks on job execution and the
/// queue itself never applies back-pressure to the router.
pub struct InProcessJobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl InProcessJobQueue {
    pub fn spawn(db: Arc<Database>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = run(&db, job).await {
                    tracing::warn!(error = %e, "background job failed");
                }
            }
        });

        Self { tx }
    }
}

impl JobQueue for InProcessJobQueue {
    fn enqueue(&self, job: Job) {
        // Receiver only drops on process shutdown; a failed send here just
        // means the job is lost during shutdown, which is acceptable for
        // best-effort archival/notification follow-up.
        let _ = self.tx.send(job);
    }
}

async fn run(db: &Arc<Database>, job: Job) -> Result<(), sqlx::Error> {
    match job {
        Job::Archive { message_id } => {
            audit::record(&db.pg, None, None, "message_archived", json!({ "message_id": message_id })).await
        }
        Job::PendingDelivery { user_id, message_id } => {
            audit::record(
                &db.pg,
                Some(user_id),
                None,
                "pending_delivery",
                json!({ "message_id": message_id }),
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue {
        jobs: Mutex<Vec<(&'static str, Uuid)>>,
    }

    impl JobQueue for RecordingQueue {
        fn enqueue(&self, job: Job) {
            let entry = match job {
                Job::Archive { message_id } => ("archive", message_id),
                Job::PendingDelivery { message_id, .. } => ("pending_delivery", message_id),
            };
            self.jobs.lock().unwrap().push(entry);
        }
    }

    #[test]
    fn enqueue_records_job_kind() {
        let queue = RecordingQueue::default();
        let message_id = Uuid::new_v4();
        queue.enqueue(Job::Archive { message_id });
        queue.enqueue(Job::PendingDelivery { user_id: Uuid::new_v4(), message_id });

        let jobs = queue.jobs.lock().unwrap();
        assert_eq!(jobs[0], ("archive", message_id));
        assert_eq!(jobs[1], ("pending_delivery", message_id));
    }
}
