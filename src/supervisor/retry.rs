//! Reconnect scheduling.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::fleet::Fleet;
use crate::load_balancer::backend::Backend;
use crate::supervisor::connect::backend_connect;

/// Open another upstream for `backend` if it is below its target.
///
/// At most one attempt is outstanding per backend, so repeated calls
/// without a state change schedule nothing new.
pub fn backend_retry(fleet: &Arc<Fleet>, backend: &Arc<Backend>) {
    if fleet.is_shutting_down() {
        return;
    }
    let Ok(handle) = Handle::try_current() else {
        tracing::debug!(backend = %backend.name, "No runtime, reconnect not scheduled");
        return;
    };

    let mut state = backend.lock();
    let requested = backend.requested_conns(fleet.settings().virtual_bind);
    let have = state.active() + state.bindavail() + state.opening;
    if have >= requested || state.opening > 0 {
        return;
    }

    state.opening += 1;
    if state.failed > 0 {
        tracing::debug!(
            backend = %backend.name,
            failed = state.failed,
            delay_ms = backend.retry_interval.as_millis() as u64,
            "Scheduling reconnect"
        );
        let task = handle.spawn(retry_after(
            Arc::downgrade(fleet),
            backend.clone(),
            backend.retry_interval,
        ));
        state.retry_timer = Some(task.abort_handle());
    } else {
        tracing::debug!(
            backend = %backend.name,
            active = state.active(),
            bindavail = state.bindavail(),
            requested,
            "Opening upstream connection"
        );
        let task = handle.spawn(backend_connect(Arc::downgrade(fleet), backend.clone()));
        state.connect_task = Some(task.abort_handle());
    }
}

async fn retry_after(fleet: Weak<Fleet>, backend: Arc<Backend>, delay: Duration) {
    tokio::time::sleep(delay).await;
    backend.lock().retry_timer = None;
    backend_connect(fleet, backend).await;
}
