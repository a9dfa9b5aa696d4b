use std::future::Future;
use std::time::Duration;

/// Platform-independent helper to spawn an async task that runs in the background.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Platform-independent helper to spawn an async task that runs in the background.
///
/// Inside a tokio runtime the task joins that runtime. Outside of one, the task
/// gets a dedicated thread driving its own current-thread runtime.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use tokio::runtime::{Builder, Handle};

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
        return;
    }

    std::thread::spawn(move || match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(future),
        Err(err) => log::warn!("failed to build background runtime: {err}"),
    });
}

/// Asynchronously waits for the provided duration in a platform-compatible way.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    sleep_impl(duration).await;
}

/// Gives other tasks a chance to run before continuing.
pub async fn yield_now() {
    #[cfg(not(target_arch = "wasm32"))]
    tokio::task::yield_now().await;
    #[cfg(target_arch = "wasm32")]
    sleep_impl(Duration::from_millis(0)).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    use gloo_timers::future::sleep;
    sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    use tokio::time::sleep;
    sleep(duration).await;
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_task_runs_on_current_runtime() {
        let (sender, receiver) = futures::channel::oneshot::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = sender.send(7);
        });
        assert_eq!(receiver.await.unwrap(), 7);
    }

    #[test]
    fn detached_task_runs_without_runtime() {
        let (sender, receiver) = std::sync::mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = sender.send(7);
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
