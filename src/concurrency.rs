//! Bounded concurrent processor (C4): reader→queue→workers pipeline with
//! early-shutdown semantics, shared by the bulk downloader (C5) and the
//! crawl engine's per-URL workers (C6).
//!
//! Grounded in `original_source/smart_fetch/iter_utils.py`'s
//! `peek_ahead_processor`: a bounded queue decouples a single producer from
//! `peek_at` concurrent workers; any worker's non-cancel error flips a shared
//! shutdown flag, after which pending items are drained without running, the
//! remaining workers are cancelled, and the first error is surfaced.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::ClientError;

/// Default worker count: 2x the HTTP client's connection-pool size (spec §4.4
/// / §5). `reqwest`'s default pool doesn't expose a fixed size, so callers
/// pass whatever they've configured their client with.
pub fn default_peek_at(pool_size: usize) -> usize {
    pool_size * 2
}

struct Shared {
    shutdown: AtomicBool,
    first_error: Mutex<Option<ClientError>>,
}

/// Runs `worker` over every item produced by `produce`, with at most
/// `peek_at` invocations in flight. `produce` is called once, up front, and
/// is expected to push items into the passed sender; the pipeline completes
/// normally once `produce` returns and every queued item has been run (or,
/// on error, drained).
pub async fn run_bounded<T, P, PFut, W, WFut>(
    peek_at: usize,
    produce: P,
    worker: W,
) -> Result<(), ClientError>
where
    T: Send + 'static,
    P: FnOnce(mpsc::Sender<T>) -> PFut,
    PFut: Future<Output = ()> + Send + 'static,
    W: Fn(T) -> WFut + Clone + Send + Sync + 'static,
    WFut: Future<Output = Result<(), ClientError>> + Send,
{
    let peek_at = peek_at.max(1);
    let (tx, rx) = mpsc::channel::<T>(peek_at);
    let rx = Arc::new(Mutex::new(rx));
    let shared = Arc::new(Shared {
        shutdown: AtomicBool::new(false),
        first_error: Mutex::new(None),
    });

    let producer = tokio::spawn(produce(tx));

    let mut handles = Vec::with_capacity(peek_at);
    for _ in 0..peek_at {
        let rx = rx.clone();
        let shared = shared.clone();
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(item) = item else { break };

                if shared.shutdown.load(Ordering::SeqCst) {
                    // Drain without executing: this item is dropped, loop
                    // continues to drain the rest.
                    continue;
                }

                if let Err(err) = worker(item).await {
                    shared.shutdown.store(true, Ordering::SeqCst);
                    let mut first = shared.first_error.lock().await;
                    if first.is_none() {
                        *first = Some(err);
                    }
                }
            }
        }));
    }

    let _ = producer.await;
    for handle in handles {
        let _ = handle.await;
    }

    let first_error = shared.first_error.lock().await.take();
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_every_item_when_no_errors() {
        let processed = Arc::new(AtomicUsize::new(0));
        let p = processed.clone();
        run_bounded(
            4,
            |tx: mpsc::Sender<i32>| async move {
                for i in 0..20 {
                    if tx.send(i).await.is_err() {
                        break;
                    }
                }
            },
            move |_item| {
                let p = p.clone();
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn first_error_wins_and_remaining_items_are_drained_not_run() {
        let processed = Arc::new(AtomicUsize::new(0));
        let p = processed.clone();
        let result = run_bounded(
            2,
            |tx: mpsc::Sender<i32>| async move {
                for i in 0..50 {
                    if tx.send(i).await.is_err() {
                        break;
                    }
                }
            },
            move |item| {
                let p = p.clone();
                async move {
                    if item == 3 {
                        return Err(ClientError::Fatal("boom".to_string()));
                    }
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert!(result.is_err());
        // Not all 50 items ran: shutdown drained the rest.
        assert!(processed.load(Ordering::SeqCst) < 50);
    }
}
