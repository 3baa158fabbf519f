use crate::{
    amo::CrmApi, calendar::DayClassifier, imagegen::ImageRenderer, pipeline::Pipeline,
    registry::PermitRegistry, store::OrderStore, webhook::StatusChange,
};
use std::sync::Arc;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{error, warn};
use uuid::Uuid;

/// Bounded dispatch for lead processing so the webhook handler can
/// acknowledge immediately and never blocks on CRM round-trips.
#[derive(Clone)]
pub struct LeadQueue {
    tx: mpsc::Sender<LeadJob>,
}

#[derive(Clone, Debug)]
pub struct LeadJob {
    pub lead_id: i64,
    pub status_change: Option<StatusChange>,
}

impl LeadQueue {
    pub fn spawn<S, C, D, R, I>(pipeline: Arc<Pipeline<S, C, D, R, I>>) -> (Self, JoinHandle<()>)
    where
        S: OrderStore + 'static,
        C: CrmApi + 'static,
        D: DayClassifier + 'static,
        R: PermitRegistry + 'static,
        I: ImageRenderer + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<LeadJob>(queue_capacity_from_env());
        let slots = Arc::new(Semaphore::new(worker_concurrency_from_env()));

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    let job_id = Uuid::new_v4();
                    if let Err(err) = pipeline.process_lead(job.lead_id, job.status_change).await {
                        error!(
                            job_id = %job_id,
                            lead_id = job.lead_id,
                            error = %err,
                            "lead job failed"
                        );
                    }
                    drop(permit);
                });
            }
        });

        (Self { tx }, handle)
    }

    /// Fire-and-forget enqueue. Delivery is best-effort: a full queue
    /// drops the job, which the next webhook for the lead makes up for.
    pub fn enqueue(&self, job: LeadJob) {
        if let Err(err) = self.tx.try_send(job) {
            warn!(error = %err, "lead queue full, dropping job");
        }
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

fn worker_concurrency_from_env() -> usize {
    std::env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8)
}
