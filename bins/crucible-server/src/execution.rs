/// Execution driver - worker-side glue for one job
///
/// Marks the job as processing, runs the executor on a blocking worker
/// thread, relays its output chunks onto the bus from a cooperative
/// publisher task, and finishes the job record. Knows nothing about how
/// code executes or who is listening.
///
/// Exactly one terminal bus event leaves here per job: `complete` when the
/// executor produced a result (including compile failures and timeouts),
/// `error` when it could not run at all.
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crucible_common::config::Settings;
use crucible_common::types::{BusMessage, Language, StreamKind};

use crate::bus::{BusError, MessageBus};
use crate::executor::{self, ExecuteRequest};
use crate::store::{JobStore, StoreError};

/// Run one job to completion. Spawned by the orchestrator; keeps going if
/// the client disconnects so the record and terminal event still land.
#[allow(clippy::too_many_arguments)]
pub async fn run_job(
    store: Arc<dyn JobStore>,
    bus: Arc<dyn MessageBus>,
    settings: Arc<Settings>,
    job_id: Uuid,
    code: String,
    language: Language,
    filename: String,
    input: Receiver<Vec<u8>>,
    cancel: Arc<AtomicBool>,
) {
    info!(job_id = %job_id, language = %language, phase = "starting", "Executing job");

    if let Err(e) = retry_store(|| store.mark_processing(job_id)).await {
        error!(job_id = %job_id, error = %e, "Could not move job to processing");
        publish_terminal(
            bus.as_ref(),
            job_id,
            &BusMessage::Error {
                message: "internal error: job could not be started".to_string(),
            },
        )
        .await;
        return;
    }

    // Output chunks cross from the worker thread over this channel; the
    // publisher task owns the cooperative side of the bus handle.
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let message = BusMessage::Output {
                    stream: StreamKind::Stdout,
                    data: String::from_utf8_lossy(&chunk).into_owned(),
                };
                if let Err(e) = retry_bus(|| bus.publish(job_id, &message)).await {
                    warn!(job_id = %job_id, error = %e, "Dropping output chunk");
                }
            }
        })
    };

    let request = ExecuteRequest {
        code,
        filename,
        on_output: Box::new(move |chunk: &[u8]| {
            let _ = chunk_tx.send(chunk.to_vec());
        }),
        input,
        cancel,
    };
    let worker_settings = settings.as_ref().clone();
    let outcome = tokio::task::spawn_blocking(move || {
        executor::for_language(language, worker_settings).execute(request)
    })
    .await;

    // The executor dropped its callback; wait for the last chunk to reach
    // the bus so no output can trail the terminal event.
    let _ = publisher.await;

    match outcome {
        Ok(Ok(result)) => {
            info!(
                job_id = %job_id,
                exit_code = result.exit_code,
                execution_time = result.execution_time,
                phase = "completed",
                "Execution finished"
            );
            // Out-of-band text (the sanitized compile log) goes out on the
            // stderr-marked stream before the terminal event.
            if !result.stderr.is_empty() {
                let message = BusMessage::Output {
                    stream: StreamKind::Stderr,
                    data: result.stderr.clone(),
                };
                if let Err(e) = retry_bus(|| bus.publish(job_id, &message)).await {
                    warn!(job_id = %job_id, error = %e, "Dropping build log");
                }
            }

            if let Err(e) = retry_store(|| store.mark_completed(job_id, &result)).await {
                error!(job_id = %job_id, error = %e, "Could not store job result");
                publish_terminal(
                    bus.as_ref(),
                    job_id,
                    &BusMessage::Error {
                        message: "internal error: result could not be stored".to_string(),
                    },
                )
                .await;
                return;
            }

            publish_terminal(
                bus.as_ref(),
                job_id,
                &BusMessage::Complete {
                    exit_code: result.exit_code,
                    execution_time: result.execution_time,
                },
            )
            .await;
        }
        Ok(Err(executor_error)) => {
            let message = executor_error.to_string();
            error!(job_id = %job_id, error = %message, phase = "failed", "Execution failed");
            if let Err(e) = retry_store(|| store.mark_failed(job_id, &message, None)).await {
                error!(job_id = %job_id, error = %e, "Could not store job failure");
            }
            publish_terminal(bus.as_ref(), job_id, &BusMessage::Error { message }).await;
        }
        Err(join_error) => {
            error!(job_id = %job_id, error = %join_error, "Executor worker panicked");
            let message = "internal error: executor crashed".to_string();
            if let Err(e) = retry_store(|| store.mark_failed(job_id, &message, None)).await {
                error!(job_id = %job_id, error = %e, "Could not store job failure");
            }
            publish_terminal(bus.as_ref(), job_id, &BusMessage::Error { message }).await;
        }
    }
}

async fn publish_terminal(bus: &dyn MessageBus, job_id: Uuid, message: &BusMessage) {
    if let Err(e) = retry_bus(|| bus.publish(job_id, message)).await {
        // Nothing downstream can hear us; the job record still holds the
        // outcome and the socket will close on its deadline.
        error!(job_id = %job_id, error = %e, "Failed to publish terminal event");
    }
}

/// One retry with jittered backoff, only for transient backend trouble.
pub(crate) async fn retry_store<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            backoff().await;
            op().await
        }
        other => other,
    }
}

pub(crate) async fn retry_bus<T, F, Fut>(mut op: F) -> Result<T, BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    match op().await {
        Err(_) => {
            backoff().await;
            op().await
        }
        other => other,
    }
}

async fn backoff() {
    let jitter_ms = rand::thread_rng().gen_range(50..150);
    tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
}
