//! Bounded, order-preserving source → worker → drain pipeline.
//!
//! One driver thread runs the source and the drain; `nth - 1` spawned
//! workers pull items from a bounded `in` channel and push results to a
//! bounded `out` channel. The driver keeps the number of in-flight items
//! between `2·nth` and `8·nth`, and when the `in` channel is full it
//! runs the worker inline itself so a stalled queue can never wedge the
//! stream. Workers shut down when the `in` channel disconnects.
//!
//! Both the index builder and the mapper drive their work through
//! [`Pipeline::stream`]; drains that must observe packets in input order
//! reorder them with an [`OrderedDrain`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, TrySendError};

use crate::error::LramError;

/// Queue capacity per worker thread.
const QUEUE_SCALE: usize = 16;

/// A fixed-width pool of worker threads plus the calling (driver) thread.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    nth: usize,
}

impl Pipeline {
    pub fn new(nth: usize) -> Self {
        Self { nth: nth.max(1) }
    }

    pub fn nth(&self) -> usize {
        self.nth
    }

    /// Stream items from `source` through per-thread workers into `drain`.
    ///
    /// `worker_init(tid)` builds one worker closure per thread; the
    /// driver only builds its own (tid 0) when it has to self-help.
    /// The drain observes results in completion order; use an
    /// [`OrderedDrain`] inside `drain` when input order matters.
    pub fn stream<T, U, SF, WF, W, DF>(
        &self,
        mut source: SF,
        worker_init: WF,
        mut drain: DF,
    ) -> crate::Result<()>
    where
        T: Send,
        U: Send,
        SF: FnMut() -> crate::Result<Option<T>>,
        WF: Fn(usize) -> W + Sync,
        W: FnMut(T) -> U,
        DF: FnMut(U) -> crate::Result<()>,
    {
        let nth = self.nth;
        if nth <= 1 {
            let mut work = worker_init(0);
            while let Some(item) = source()? {
                drain(work(item))?;
            }
            return Ok(());
        }

        let (in_tx, in_rx) = bounded::<T>(QUEUE_SCALE * nth);
        let (out_tx, out_rx) = bounded::<U>(QUEUE_SCALE * nth);

        thread::scope(|s| {
            for tid in 1..nth {
                let in_rx = in_rx.clone();
                let out_tx = out_tx.clone();
                let worker_init = &worker_init;
                s.spawn(move || {
                    let mut work = worker_init(tid);
                    for item in in_rx.iter() {
                        if out_tx.send(work(item)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(out_tx);

            let mut selfw: Option<W> = None;
            let (lb, ub) = (2 * nth, 8 * nth);
            let mut bal = 0usize;
            let mut err: Option<LramError> = None;

            'source: loop {
                let item = match source() {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                };
                match in_tx.try_send(item) {
                    Ok(()) => bal += 1,
                    Err(TrySendError::Full(item)) => {
                        // self-help: run the worker on the driver thread
                        let work = selfw.get_or_insert_with(|| worker_init(0));
                        if let Err(e) = drain(work(item)) {
                            err = Some(e);
                            break;
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        err = Some(LramError::ThreadError(
                            "worker input queue disconnected".to_string(),
                        ));
                        break;
                    }
                }
                if bal < ub {
                    continue;
                }
                // too many in flight: drain down to the low water mark
                while bal > lb {
                    match out_rx.try_recv() {
                        Ok(done) => {
                            bal -= 1;
                            if let Err(e) = drain(done) {
                                err = Some(e);
                                break 'source;
                            }
                        }
                        Err(_) => {
                            if let Ok(item) = in_rx.try_recv() {
                                bal -= 1;
                                let work = selfw.get_or_insert_with(|| worker_init(0));
                                if let Err(e) = drain(work(item)) {
                                    err = Some(e);
                                    break 'source;
                                }
                            } else {
                                thread::yield_now();
                            }
                        }
                    }
                }
            }

            // source depleted (or failed): let workers wind down
            drop(in_tx);

            while err.is_none() && bal > 0 {
                match out_rx.recv_timeout(Duration::from_millis(2)) {
                    Ok(done) => {
                        bal -= 1;
                        if let Err(e) = drain(done) {
                            err = Some(e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if let Ok(item) = in_rx.try_recv() {
                            bal -= 1;
                            let work = selfw.get_or_insert_with(|| worker_init(0));
                            if let Err(e) = drain(work(item)) {
                                err = Some(e);
                            }
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        // workers exited; anything left in `in` is ours
                        match in_rx.try_recv() {
                            Ok(item) => {
                                bal -= 1;
                                let work = selfw.get_or_insert_with(|| worker_init(0));
                                if let Err(e) = drain(work(item)) {
                                    err = Some(e);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }

            // unblock any workers still sending, then the scope joins them
            for _ in out_rx.iter() {}

            match err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    /// Run `worker(tid)` once on every thread, including the driver.
    pub fn parallel<F>(&self, worker: F)
    where
        F: Fn(usize) + Sync,
    {
        thread::scope(|s| {
            for tid in 1..self.nth {
                let worker = &worker;
                s.spawn(move || worker(tid));
            }
            worker(0);
        });
    }

    /// Split `items` into `nth` contiguous ranges and run `worker` over
    /// each on its own thread (range 0 on the driver). Results come back
    /// in range order.
    pub fn parallel_chunks<T, R, F>(&self, items: &mut [T], worker: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, &mut [T]) -> R + Sync,
    {
        let total = items.len();
        let nth = self.nth.min(total.max(1));
        let mut chunks: Vec<&mut [T]> = Vec::with_capacity(nth);
        let mut rest = items;
        let mut start = 0;
        for tid in 0..nth {
            let end = (tid + 1) * total / nth;
            let (head, tail) = rest.split_at_mut(end - start);
            chunks.push(head);
            rest = tail;
            start = end;
        }

        thread::scope(|s| {
            let mut iter = chunks.into_iter();
            let first = iter.next().expect("at least one chunk");
            let handles: Vec<_> = iter
                .enumerate()
                .map(|(i, chunk)| {
                    let worker = &worker;
                    s.spawn(move || worker(i + 1, chunk))
                })
                .collect();
            let mut out = Vec::with_capacity(nth);
            out.push(worker(0, first));
            for h in handles {
                out.push(h.join().expect("pipeline worker panicked"));
            }
            out
        })
    }
}

struct Keyed<T> {
    id: u64,
    item: T,
}

impl<T> PartialEq for Keyed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for Keyed<T> {}
impl<T> PartialOrd for Keyed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Keyed<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

/// Min-heap reordering buffer: push results keyed by packet id, pop them
/// strictly in id order.
pub struct OrderedDrain<T> {
    heap: BinaryHeap<Reverse<Keyed<T>>>,
    next: u64,
}

impl<T> Default for OrderedDrain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedDrain<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next: 0,
        }
    }

    pub fn push(&mut self, id: u64, item: T) {
        self.heap.push(Reverse(Keyed { id, item }));
    }

    /// The next item in id order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        if self.heap.peek().map(|Reverse(k)| k.id) == Some(self.next) {
            self.next += 1;
            Some(self.heap.pop().unwrap().0.item)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_thread_stream() {
        let mut n = 0u64;
        let mut seen = Vec::new();
        Pipeline::new(1)
            .stream(
                || {
                    n += 1;
                    Ok(if n <= 100 { Some(n) } else { None })
                },
                |_tid| |x: u64| x * 2,
                |y| {
                    seen.push(y);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(seen, (1..=100).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_stream_processes_everything() {
        let mut n = 0u64;
        let mut sum = 0u64;
        Pipeline::new(4)
            .stream(
                || {
                    n += 1;
                    Ok(if n <= 1024 { Some(n) } else { None })
                },
                |_tid| |x: u64| x + 1,
                |y| {
                    sum += y;
                    Ok(())
                },
            )
            .unwrap();
        // sum of 2..=1025
        assert_eq!(sum, (2..=1025).sum::<u64>());
    }

    #[test]
    fn test_ordered_drain_releases_in_order() {
        // ids arriving shuffled come out 0..n strictly increasing
        let mut hq = OrderedDrain::new();
        let mut out = Vec::new();
        for id in [3u64, 1, 0, 5, 2, 4] {
            hq.push(id, id);
            while let Some(item) = hq.pop_ready() {
                out.push(item);
            }
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);
        assert!(hq.is_empty());
    }

    #[test]
    fn test_stream_order_with_uneven_workers() {
        // packets with ascending ids and a worker that sleeps (id % 7) ms
        // must drain in id order through an OrderedDrain
        let mut next = 0u64;
        let mut hq = OrderedDrain::new();
        let mut drained = Vec::new();
        Pipeline::new(4)
            .stream(
                || {
                    let id = next;
                    next += 1;
                    Ok(if id < 256 { Some(id) } else { None })
                },
                |_tid| {
                    |id: u64| {
                        thread::sleep(Duration::from_millis(id % 7));
                        id
                    }
                },
                |id| {
                    hq.push(id, id);
                    while let Some(got) = hq.pop_ready() {
                        drained.push(got);
                    }
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(drained, (0..256).collect::<Vec<_>>());
    }

    #[test]
    fn test_source_error_propagates() {
        let mut n = 0u64;
        let err = Pipeline::new(2)
            .stream(
                || {
                    n += 1;
                    if n > 10 {
                        Err(LramError::ParserBroken("boom".to_string()))
                    } else {
                        Ok(Some(n))
                    }
                },
                |_tid| |x: u64| x,
                |_y| Ok(()),
            )
            .unwrap_err();
        assert!(matches!(err, LramError::ParserBroken(_)));
    }

    #[test]
    fn test_parallel_runs_every_tid() {
        use std::sync::atomic::{AtomicU64, Ordering};
        let hits = AtomicU64::new(0);
        Pipeline::new(4).parallel(|tid| {
            hits.fetch_add(1 << (8 * tid), Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 0x0101_0101);
    }

    #[test]
    fn test_parallel_chunks_covers_all_items() {
        let mut items: Vec<u64> = (0..1000).collect();
        let sums = Pipeline::new(4).parallel_chunks(&mut items, |_tid, chunk| {
            for x in chunk.iter_mut() {
                *x += 1;
            }
            chunk.iter().sum::<u64>()
        });
        assert_eq!(sums.len(), 4);
        assert_eq!(sums.iter().sum::<u64>(), (1..=1000).sum::<u64>());
    }
}
