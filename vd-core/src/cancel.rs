//! Stop signal for long waits inside a unit of work
//!
//! A controller loop runs its work inside [`scope`] with the receiving end of
//! its stop flag. Waits that may outlast a stop request (pause actions,
//! pre-output holds) go through [`sleep_unless_stopped`] so a stop cuts them
//! short. Outside a scope the sleep is a plain sleep.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

tokio::task_local! {
    static STOP: watch::Receiver<bool>;
}

/// Run `work` with `stop` as the signal seen by [`sleep_unless_stopped`]
pub async fn scope<F: Future>(stop: watch::Receiver<bool>, work: F) -> F::Output {
    STOP.scope(stop, work).await
}

/// True when the enclosing scope has been asked to stop
pub fn stop_requested() -> bool {
    STOP.try_with(|stop| *stop.borrow()).unwrap_or(false)
}

/// Sleep for `duration`; returns false when a stop request ended it early
pub async fn sleep_unless_stopped(duration: Duration) -> bool {
    let Ok(mut stop) = STOP.try_with(|stop| stop.clone()) else {
        tokio::time::sleep(duration).await;
        return true;
    };
    let stopped = async move {
        if stop.wait_for(|requested| *requested).await.is_err() {
            // Sender gone: nobody can ask us to stop any more
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stopped => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_without_scope_runs_full_length() {
        let started = Instant::now();
        assert!(!stop_requested());
        assert!(sleep_unless_stopped(Duration::from_secs(30)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cuts_sleep_short() {
        let (tx, rx) = watch::channel(false);
        let started = Instant::now();
        let sleeper = tokio::spawn(scope(rx, async {
            let finished = sleep_unless_stopped(Duration::from_secs(300)).await;
            (finished, stop_requested())
        }));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send_replace(true);
        let (finished, requested) = sleeper.await.unwrap();
        assert!(!finished);
        assert!(requested);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_keeps_sleeping() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let started = Instant::now();
        assert!(scope(rx, sleep_unless_stopped(Duration::from_secs(12))).await);
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }
}
