//! Order-preserving parallel map
//!
//! Workers take turns pulling from the shared upstream cursor. Each pull
//! claims the next sequence number and a slot at the back of a bounded
//! ring; the worker then applies the function outside every lock and fills
//! its slot. The consumer only ever takes the front slot, so results leave
//! in upstream order even though workers finish out of order.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use ml_input_core::error::{Error, Result};
use ml_input_core::transform::MapIterator;
use ml_input_core::{CapturedFunction, Dataset, DatasetBase, Record, RecordIterator, Signature};

use crate::ParallelMapOptions;

/// Buffer and coordination state shared by the consumer and the workers
struct State {
    /// Slots in upstream order; `None` while the record is in flight
    slots: VecDeque<Option<Result<Record>>>,

    /// Sequence number of `slots[0]`
    front_seq: u64,

    /// Sequence number the next claimed slot receives
    next_seq: u64,

    /// Upstream has signalled end of stream
    end_of_input: bool,

    /// The iterator is being torn down
    cancelled: bool,

    /// Workers that have not exited yet
    active_workers: usize,

    /// Failure that stopped the workers outside any single record
    worker_error: Option<Error>,
}

struct Shared {
    state: Mutex<State>,

    /// Signalled when a slot is filled or a worker exits
    slot_ready: Condvar,

    /// Signalled when the consumer frees a slot or on cancellation
    space_available: Condvar,

    /// Upstream cursor, pulled by one worker at a time
    input: Mutex<Box<dyn RecordIterator>>,

    func: CapturedFunction,
    signature: Signature,
    capacity: usize,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        // no user code runs under this lock, so a poisoned guard is consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the next slot and pull its record, `None` when the worker should exit
    fn claim(&self) -> Result<Option<(u64, Result<Record>)>> {
        let mut input = self
            .input
            .lock()
            .map_err(|_| Error::internal("parallel map upstream panicked"))?;
        let seq = {
            let mut st = self.lock_state();
            while !st.cancelled && !st.end_of_input && st.slots.len() >= self.capacity {
                st = self
                    .space_available
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if st.cancelled || st.end_of_input {
                return Ok(None);
            }
            st.slots.push_back(None);
            let seq = st.next_seq;
            st.next_seq += 1;
            seq
        };
        match input.get_next() {
            Ok(Some(record)) => Ok(Some((seq, Ok(record)))),
            Err(e) => Ok(Some((seq, Err(e)))),
            Ok(None) => {
                let mut st = self.lock_state();
                st.end_of_input = true;
                // claims happen under the input lock, so ours is the newest slot
                st.slots.pop_back();
                st.next_seq = seq;
                drop(st);
                self.slot_ready.notify_all();
                self.space_available.notify_all();
                Ok(None)
            }
        }
    }

    fn apply(&self, record: Record) -> Result<Record> {
        let out = catch_unwind(AssertUnwindSafe(|| self.func.call(record)))
            .map_err(|_| Error::internal("parallel map function panicked"))??;
        self.signature.check_record(&out)?;
        Ok(out)
    }

    fn fill(&self, seq: u64, result: Result<Record>) {
        let mut st = self.lock_state();
        // slots are only popped once filled, so `seq` is still buffered
        if let Some(offset) = seq.checked_sub(st.front_seq).and_then(|o| usize::try_from(o).ok()) {
            if let Some(slot) = st.slots.get_mut(offset) {
                *slot = Some(result);
            }
        }
        drop(st);
        self.slot_ready.notify_all();
    }

    fn worker_loop(&self) -> Result<()> {
        while let Some((seq, pulled)) = self.claim()? {
            let result = pulled.and_then(|record| self.apply(record));
            self.fill(seq, result);
        }
        Ok(())
    }

    fn run_worker(&self, index: usize) {
        trace!(worker = index, "parallel map worker started");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.worker_loop()))
            .unwrap_or_else(|_| Err(Error::internal("parallel map worker panicked")));
        let mut st = self.lock_state();
        st.active_workers -= 1;
        if let Err(e) = outcome {
            warn!(worker = index, error = %e, "parallel map worker failed");
            st.end_of_input = true;
            st.worker_error.get_or_insert(e);
        }
        drop(st);
        self.slot_ready.notify_all();
        self.space_available.notify_all();
        trace!(worker = index, "parallel map worker exited");
    }
}

/// Cursor over a parallel map; dropping it stops and joins every worker
struct ParallelMapIterator {
    shared: Arc<Shared>,
    num_threads: usize,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl ParallelMapIterator {
    fn start(&mut self) -> Result<()> {
        self.shared.func.check_captures()?;
        debug!(
            num_threads = self.num_threads,
            output_buffer_size = self.shared.capacity,
            "starting parallel map workers"
        );
        self.started = true;
        for index in 0..self.num_threads {
            let shared = Arc::clone(&self.shared);
            self.shared.lock_state().active_workers += 1;
            let spawned = thread::Builder::new()
                .name(format!("ml-input-map-{index}"))
                .spawn(move || shared.run_worker(index));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.shared.lock_state().active_workers -= 1;
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }
}

impl RecordIterator for ParallelMapIterator {
    fn get_next(&mut self) -> Result<Option<Record>> {
        if !self.started {
            self.start()?;
        }
        let mut st = self.shared.lock_state();
        loop {
            if matches!(st.slots.front(), Some(Some(_))) {
                let slot = st.slots.pop_front().flatten();
                st.front_seq += 1;
                drop(st);
                self.shared.space_available.notify_all();
                return match slot {
                    Some(result) => result.map(Some),
                    None => Err(Error::internal("parallel map slot vanished")),
                };
            }
            if st.active_workers == 0 {
                if let Some(e) = st.worker_error.take() {
                    return Err(e);
                }
                if st.slots.is_empty() {
                    return Ok(None);
                }
                st.slots.clear();
                return Err(Error::internal("parallel map workers exited with records in flight"));
            }
            if st.slots.is_empty() && st.end_of_input {
                return Ok(None);
            }
            st = self
                .shared
                .slot_ready
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for ParallelMapIterator {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        debug!(workers = self.workers.len(), "stopping parallel map workers");
        self.shared.lock_state().cancelled = true;
        self.shared.space_available.notify_all();
        self.shared.slot_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("parallel map worker panicked during shutdown");
            }
        }
    }
}

/// Parallel map stage description
pub(crate) struct ParallelMapDataset {
    pub(crate) input: Dataset,
    pub(crate) func: CapturedFunction,
    pub(crate) signature: Signature,
    pub(crate) options: ParallelMapOptions,
}

impl DatasetBase for ParallelMapDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let ParallelMapOptions {
            num_threads,
            output_buffer_size,
        } = self.options;
        if output_buffer_size == 0 {
            return Err(Error::invalid_argument("output_buffer_size must be greater than zero"));
        }
        let input = self.input.make_iterator()?;
        if num_threads <= 1 {
            return Ok(Box::new(MapIterator::new(input, self.func.clone(), self.signature.clone())));
        }
        Ok(Box::new(ParallelMapIterator {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slots: VecDeque::with_capacity(output_buffer_size),
                    front_seq: 0,
                    next_seq: 0,
                    end_of_input: false,
                    cancelled: false,
                    active_workers: 0,
                    worker_error: None,
                }),
                slot_ready: Condvar::new(),
                space_available: Condvar::new(),
                input: Mutex::new(input),
                func: self.func.clone(),
                signature: self.signature.clone(),
                capacity: output_buffer_size,
            }),
            num_threads,
            workers: Vec::with_capacity(num_threads),
            started: false,
        }))
    }

    fn debug_name(&self) -> &'static str {
        "ParallelMapDataset"
    }
}
