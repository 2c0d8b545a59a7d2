//! The fixed-size (but growable) worker pool: scheduling, aggregate log
//! fan-in, and pool-level lifecycle events (spec §4.3).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::aggregate::{self, AggregateSender, AggregateStream};
use crate::client::{read_response_head, ResponseHead};
use crate::error::Result;
use crate::worker::{
    spawn_worker, Lease, ProxyRequest, WorkerEvent, WorkerHandle, WorkerId, WorkerOptions,
    WorkerState,
};

/// A pool-level event: every worker event forwarded verbatim, plus the two
/// aggregate-crossing events from spec §4.3's Construction rule.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Forwarded from one of the pool's workers.
    Worker(WorkerId, WorkerEvent),
    /// Ready-count crossed from 0 to positive.
    Ready,
    /// Alive-count crossed from positive to 0.
    Exit,
}

/// The result of one proxied exchange: the parsed response head, plus the
/// still-open lease so the caller can drain the body (and write any
/// remaining request data).
#[derive(Debug)]
pub struct ProxyResponse {
    /// Status code and headers.
    pub head: ResponseHead,
    /// The leased exchange; dropping it returns the worker to `ready`.
    pub lease: Lease,
}

/// A supervised collection of workers sharing a scheduling policy.
#[derive(Debug)]
pub struct Pool {
    workers: Mutex<Vec<WorkerHandle>>,
    cursor: AtomicUsize,
    next_id: AtomicUsize,
    base_options: WorkerOptions,
    stdout_tx: AggregateSender,
    stderr_tx: AggregateSender,
    pool_tx: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
    events_tx: broadcast::Sender<PoolEvent>,
    ready_count: AtomicUsize,
    alive_count: AtomicUsize,
}

impl Pool {
    /// Construct a pool of `size` workers (spec §4.3's Construction rule).
    /// Workers are created but not spawned; call [`Pool::spawn`] to launch
    /// them. Returns the pool plus its two aggregate log streams (stdout,
    /// then stderr).
    pub fn new(options: WorkerOptions, size: usize) -> (Arc<Pool>, AggregateStream, AggregateStream) {
        assert!(size >= 1, "pool size must be at least 1");

        let (stdout_tx, stdout_stream) = aggregate::channel();
        let (stderr_tx, stderr_stream) = aggregate::channel();
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(256);

        let next_id = AtomicUsize::new(0);
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let id = WorkerId(next_id.fetch_add(1, Ordering::SeqCst));
            workers.push(spawn_worker(
                id,
                options.clone(),
                stdout_tx.clone(),
                stderr_tx.clone(),
                pool_tx.clone(),
            ));
        }

        let pool = Arc::new(Pool {
            workers: Mutex::new(workers),
            cursor: AtomicUsize::new(0),
            next_id,
            base_options: options,
            stdout_tx,
            stderr_tx,
            pool_tx,
            events_tx,
            ready_count: AtomicUsize::new(0),
            alive_count: AtomicUsize::new(0),
        });

        spawn_event_loop(Arc::clone(&pool), pool_rx);

        (pool, stdout_stream, stderr_stream)
    }

    /// Number of workers currently in the pool (grows with [`Pool::increment`]).
    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Subscribe to pool-level events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    /// Current count of `ready` workers.
    pub fn ready_count(&self) -> usize {
        self.ready_count.load(Ordering::SeqCst)
    }

    /// Current count of non-`absent` workers.
    pub fn alive_count(&self) -> usize {
        self.alive_count.load(Ordering::SeqCst)
    }

    async fn snapshot(&self) -> Vec<WorkerHandle> {
        self.workers.lock().await.clone()
    }

    /// Spawn every worker (spec §4.3's `spawn()`).
    pub async fn spawn(&self) {
        let workers = self.snapshot().await;
        tracing::info!(count = workers.len(), "spawning pool");
        for worker in workers {
            let _ = worker.spawn().await;
        }
    }

    /// Send a graceful quit to every worker.
    pub async fn quit(&self) {
        let workers = self.snapshot().await;
        tracing::info!(count = workers.len(), "quitting pool");
        for worker in workers {
            worker.quit();
        }
    }

    /// Send a forceful terminate to every worker.
    pub async fn terminate(&self) {
        let workers = self.snapshot().await;
        tracing::info!(count = workers.len(), "terminating pool");
        for worker in workers {
            worker.terminate();
        }
    }

    /// Pick the next worker to serve a request, per spec §4.3's scheduling
    /// rule: prefer any `ready` worker scanning in insertion order; else the
    /// worker at the round-robin cursor, advancing it modulo pool size.
    pub async fn next_worker(&self) -> WorkerHandle {
        let workers = self.snapshot().await;
        let states: Vec<WorkerState> = workers.iter().map(|w| w.state()).collect();
        let cursor = self.cursor.load(Ordering::SeqCst);
        let (index, advance) = pick_next(&states, cursor);
        if advance {
            self.cursor
                .store((cursor + 1) % workers.len(), Ordering::SeqCst);
        }
        workers[index].clone()
    }

    /// Delegate one proxied exchange to the next scheduled worker (spec
    /// §4.3's `proxy(req, res, next)`), pumping the request's body (if any)
    /// to the worker before reading back the response head — spec §4.1's
    /// `proxyRequest` bidirectional body pumping.
    pub async fn proxy(&self, mut request: ProxyRequest) -> Result<ProxyResponse> {
        let body = request.body.take();
        let worker = self.next_worker().await;
        tracing::debug!(worker = worker.id().0, method = %request.method, path = %request.path, "proxying request");
        let mut lease = worker.create_connection(request).await?;
        lease.writer.write_body(body).await?;
        let head = read_response_head(&mut lease.body).await?;
        tracing::debug!(worker = worker.id().0, status = head.status, "proxy response head");
        Ok(ProxyResponse { head, lease })
    }

    /// Append a new worker; the pool grows beyond its initial size.
    pub async fn increment(&self) {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::info!(worker = id.0, "incrementing pool");
        let handle = spawn_worker(
            id,
            self.base_options.clone(),
            self.stdout_tx.clone(),
            self.stderr_tx.clone(),
            self.pool_tx.clone(),
        );
        self.workers.lock().await.push(handle);
    }

    /// Remove the head worker and tell it to quit.
    pub async fn decrement(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            let removed = workers.remove(0);
            tracing::info!(worker = removed.id().0, "decrementing pool");
            removed.quit();
        }
    }

    /// Quit every worker, then spawn each again once its child has exited,
    /// resolving once a pool-level `ready` has been observed (or
    /// immediately if the pool was already fully absent).
    ///
    /// The source's callback-on-next-`ready` shape becomes ordinary
    /// `async`/`await` sequencing here: awaiting `restart()` is the
    /// callback firing.
    pub async fn restart(&self) {
        tracing::info!("restarting pool");
        if self.alive_count() == 0 {
            for worker in self.snapshot().await {
                let _ = worker.spawn().await;
            }
            return;
        }

        let mut events = self.subscribe();
        for worker in self.snapshot().await {
            worker.restart().await;
        }
        while let Ok(event) = events.recv().await {
            if matches!(event, PoolEvent::Ready) {
                break;
            }
        }
        tracing::debug!("pool restart observed ready");
    }
}

/// Pure scheduling function underlying [`Pool::next_worker`]: prefer any
/// `ready` state scanning in order; otherwise return the cursor position
/// and signal that it should advance. Exposed for unit testing without any
/// I/O (spec §8 scenario 2).
pub fn pick_next(states: &[WorkerState], cursor: usize) -> (usize, bool) {
    assert!(!states.is_empty());
    if let Some(index) = states.iter().position(|s| *s == WorkerState::Ready) {
        return (index, false);
    }
    (cursor % states.len(), true)
}

fn is_ready(state: WorkerState) -> bool {
    state == WorkerState::Ready
}

fn is_alive(state: WorkerState) -> bool {
    state != WorkerState::Absent
}

fn spawn_event_loop(
    pool: Arc<Pool>,
    mut pool_rx: mpsc::UnboundedReceiver<(WorkerId, WorkerEvent)>,
) {
    tokio::spawn(async move {
        let mut last_state = std::collections::HashMap::new();

        while let Some((id, event)) = pool_rx.recv().await {
            // Only these five events carry an implied new worker state;
            // the rest (`Spawn`, `Idle`, `Error`) don't change it.
            let new_state = match &event {
                WorkerEvent::Spawning => Some(WorkerState::Spawning),
                WorkerEvent::Ready => Some(WorkerState::Ready),
                WorkerEvent::Busy => Some(WorkerState::Busy),
                WorkerEvent::Quitting => Some(WorkerState::Quitting),
                WorkerEvent::Exit => Some(WorkerState::Absent),
                _ => None,
            };

            if let Some(new_state) = new_state {
                let prev = last_state
                    .insert(id, new_state)
                    .unwrap_or(WorkerState::Absent);
                tracing::debug!(worker = id.0, ?prev, ?new_state, "pool observed worker transition");

                if is_ready(prev) != is_ready(new_state) {
                    let count = if is_ready(new_state) {
                        pool.ready_count.fetch_add(1, Ordering::SeqCst) + 1
                    } else {
                        pool.ready_count.fetch_sub(1, Ordering::SeqCst) - 1
                    };
                    if is_ready(new_state) && count == 1 {
                        tracing::info!("pool ready");
                        let _ = pool.events_tx.send(PoolEvent::Ready);
                    }
                }

                if is_alive(prev) != is_alive(new_state) {
                    let count = if is_alive(new_state) {
                        pool.alive_count.fetch_add(1, Ordering::SeqCst) + 1
                    } else {
                        pool.alive_count.fetch_sub(1, Ordering::SeqCst) - 1
                    };
                    if !is_alive(new_state) && count == 0 {
                        tracing::info!("pool exit");
                        let _ = pool.events_tx.send(PoolEvent::Exit);
                    }
                }
            }

            let _ = pool.events_tx.send(PoolEvent::Worker(id, event));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_fallback_when_none_ready() {
        let states = [WorkerState::Busy, WorkerState::Busy];
        let mut cursor = 0;
        let mut picked = Vec::new();
        for _ in 0..4 {
            let (index, advance) = pick_next(&states, cursor);
            picked.push(index);
            if advance {
                cursor = (cursor + 1) % states.len();
            }
        }
        assert_eq!(picked, vec![0, 1, 0, 1]);
    }

    #[test]
    fn prefers_any_ready_worker_over_the_cursor() {
        let states = [WorkerState::Busy, WorkerState::Ready, WorkerState::Busy];
        let (index, advance) = pick_next(&states, 0);
        assert_eq!(index, 1);
        assert!(!advance);
    }
}
