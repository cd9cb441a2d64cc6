//! Dispatch step: eligible tasks onto free pool slots.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::{Database, EventKind, TaskEvent};
use crate::worker::WorkerPool;

/// Assign and spawn up to the pool's free capacity. Returns the number spawned.
///
/// The assignment is committed before the runner is spawned, so the runner's
/// claim always observes it.
pub(crate) async fn dispatch(
    store: &dyn Database,
    pool: &WorkerPool,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let capacity = pool.available_capacity().await;
    if capacity == 0 {
        debug!("Worker pool full, skipping dispatch");
        return Ok(0);
    }

    let eligible = store.list_dispatchable(capacity).await?;
    if eligible.is_empty() {
        return Ok(0);
    }

    let mut spawned = 0;
    for task in eligible {
        let address = pool.allocate_address();
        if !store.assign_task(task.id, &address, now).await? {
            debug!(task_id = %task.id, "Task no longer pending, skipping");
            continue;
        }

        let event = TaskEvent::new(&task, EventKind::Assigned, format!("assigned to {address}"))
            .with_worker(&address);
        if let Err(e) = store.record_event(&event).await {
            warn!(task_id = %task.id, error = %e, "Failed to record assignment event");
        }

        match pool.spawn(task.id, address.clone()).await {
            Ok(_) => {
                info!(
                    task_id = %task.id,
                    worker = %address,
                    priority = task.priority,
                    title = %task.title,
                    "Task dispatched"
                );
                spawned += 1;
            }
            Err(e) => {
                warn!(task_id = %task.id, worker = %address, error = %e, "Spawn failed, releasing task");
                store.release_task(task.id, Some(&address), false).await?;
            }
        }
    }

    Ok(spawned)
}
