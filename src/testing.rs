//! Testing utilities.
//!
//! In-memory implementations of the engine's boundary traits: a scripted
//! [`MockPuller`], a [`MemoryOffsetStore`], and collecting emit /
//! dead-letter sinks. All of them hand out cloneable probes so tests can
//! inspect state after the runtime has taken ownership.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::committer::OffsetStore;
use crate::error::EngineError;
use crate::puller::{PullBatch, RecordPuller};
use crate::record::Record;
use crate::sink::{DeadLetterSink, EmitSink};

#[derive(Debug, Default)]
struct PullerProbeState {
    poll_sizes: Vec<usize>,
    seeks: Vec<(i32, i64)>,
}

/// Scripted [`RecordPuller`] for tests.
///
/// Polls pop scripted entries in order; once the script is exhausted,
/// polls briefly wait and return empty batches. Records polled after a
/// `seek` are filtered to offsets at or above the seek position, and a
/// batch larger than `max_records` is split, with the remainder
/// re-queued at the front.
pub struct MockPuller {
    script: VecDeque<Result<PullBatch, EngineError>>,
    assignment: Vec<i32>,
    seek_floor: HashMap<i32, i64>,
    probe: Arc<Mutex<PullerProbeState>>,
}

impl MockPuller {
    /// Creates a puller with an empty script and no assignment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            assignment: Vec::new(),
            seek_floor: HashMap::new(),
            probe: Arc::new(Mutex::new(PullerProbeState::default())),
        }
    }

    /// Appends a batch of records to the script.
    pub fn push_records(&mut self, records: Vec<Record>) {
        self.script.push_back(Ok(PullBatch::Records(records)));
    }

    /// Appends an assignment change to the script.
    pub fn push_rebalance(&mut self, assignment: Vec<i32>) {
        self.script
            .push_back(Ok(PullBatch::AssignmentChanged(assignment)));
    }

    /// Appends a poll error to the script.
    pub fn push_error(&mut self, error: EngineError) {
        self.script.push_back(Err(error));
    }

    /// Returns a probe for inspecting poll sizes and seeks.
    #[must_use]
    pub fn probe(&self) -> MockPullerProbe {
        MockPullerProbe {
            state: Arc::clone(&self.probe),
        }
    }
}

impl Default for MockPuller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordPuller for MockPuller {
    async fn poll(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<PullBatch, EngineError> {
        self.probe.lock().poll_sizes.push(max_records);

        match self.script.pop_front() {
            Some(Ok(PullBatch::Records(records))) => {
                let mut visible: Vec<Record> = records
                    .into_iter()
                    .filter(|r| {
                        self.seek_floor
                            .get(&r.partition)
                            .is_none_or(|floor| r.offset >= *floor)
                    })
                    .collect();
                if visible.len() > max_records {
                    let rest = visible.split_off(max_records);
                    self.script.push_front(Ok(PullBatch::Records(rest)));
                }
                Ok(PullBatch::Records(visible))
            }
            Some(Ok(PullBatch::AssignmentChanged(assignment))) => {
                self.assignment.clone_from(&assignment);
                Ok(PullBatch::AssignmentChanged(assignment))
            }
            Some(Err(e)) => Err(e),
            None => {
                tokio::time::sleep(max_wait.min(Duration::from_millis(2))).await;
                Ok(PullBatch::Records(Vec::new()))
            }
        }
    }

    async fn seek(&mut self, partition: i32, offset: i64) -> Result<(), EngineError> {
        self.seek_floor.insert(partition, offset);
        self.probe.lock().seeks.push((partition, offset));
        Ok(())
    }

    fn assignment(&self) -> Vec<i32> {
        self.assignment.clone()
    }
}

/// Inspection handle for a [`MockPuller`].
#[derive(Clone)]
pub struct MockPullerProbe {
    state: Arc<Mutex<PullerProbeState>>,
}

impl MockPullerProbe {
    /// Returns the `max_records` value of every poll issued so far.
    #[must_use]
    pub fn poll_sizes(&self) -> Vec<usize> {
        self.state.lock().poll_sizes.clone()
    }

    /// Returns every `(partition, offset)` seek issued so far.
    #[must_use]
    pub fn seeks(&self) -> Vec<(i32, i64)> {
        self.state.lock().seeks.clone()
    }
}

#[derive(Debug, Default)]
struct OffsetStoreState {
    committed: HashMap<i32, i64>,
    history: Vec<HashMap<i32, i64>>,
    attempts: usize,
    fail_next: usize,
}

/// In-memory [`OffsetStore`] with failure injection.
///
/// Clones share state, so tests can keep a handle while the committer
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryOffsetStore {
    state: Arc<Mutex<OffsetStoreState>>,
}

impl MemoryOffsetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a durably committed offset, as if written by a previous
    /// runtime instance.
    pub fn seed_committed(&self, partition: i32, offset: i64) {
        self.state.lock().committed.insert(partition, offset);
    }

    /// Makes the next `n` commit calls fail with `ConnectionLost`.
    pub fn fail_next_commits(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Returns the committed offset for a partition.
    #[must_use]
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.state.lock().committed.get(&partition).copied()
    }

    /// Returns the number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Returns the number of commit calls, including failed ones.
    #[must_use]
    pub fn commit_attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Returns every successfully committed batch, in order.
    #[must_use]
    pub fn history(&self) -> Vec<HashMap<i32, i64>> {
        self.state.lock().history.clone()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn commit(&mut self, offsets: &HashMap<i32, i64>) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(EngineError::ConnectionLost("injected commit failure".into()));
        }
        for (p, o) in offsets {
            state.committed.insert(*p, *o);
        }
        state.history.push(offsets.clone());
        Ok(())
    }

    async fn committed(&mut self, partition: i32) -> Result<Option<i64>, EngineError> {
        Ok(self.state.lock().committed.get(&partition).copied())
    }
}

#[derive(Debug, Default)]
struct EmitSinkState {
    emitted: Vec<(Option<Vec<u8>>, Vec<u8>)>,
    delays: VecDeque<Duration>,
    fail_next: usize,
}

/// Collecting [`EmitSink`] with configurable per-emit latency and
/// failure injection. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryEmitSink {
    state: Arc<Mutex<EmitSinkState>>,
}

impl MemoryEmitSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues artificial latencies consumed one per emit; later emits
    /// complete immediately.
    pub fn push_delays(&self, delays: &[Duration]) {
        self.state.lock().delays.extend(delays.iter().copied());
    }

    /// Makes the next `n` emit calls fail.
    pub fn fail_next_emits(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Returns everything emitted so far.
    #[must_use]
    pub fn emitted(&self) -> Vec<(Option<Vec<u8>>, Vec<u8>)> {
        self.state.lock().emitted.clone()
    }
}

#[async_trait]
impl EmitSink for MemoryEmitSink {
    async fn emit(&mut self, key: Option<&[u8]>, value: &[u8]) -> Result<(), EngineError> {
        let delay = {
            let mut state = self.state.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(EngineError::Sink("injected emit failure".into()));
            }
            state.delays.pop_front()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .emitted
            .push((key.map(<[u8]>::to_vec), value.to_vec()));
        Ok(())
    }
}

/// Collecting [`DeadLetterSink`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterSink {
    published: Arc<Mutex<Vec<(Record, String)>>>,
}

impl MemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every `(record, reason)` pair delivered so far.
    #[must_use]
    pub fn published(&self) -> Vec<(Record, String)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn publish(&mut self, record: &Record, reason: &str) -> Result<(), EngineError> {
        self.published
            .lock()
            .push((record.clone(), reason.to_string()));
        Ok(())
    }
}
