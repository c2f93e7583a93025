//! Strict two-phase locking over page ids, with waits-for-graph deadlock
//! detection and a global lock-wait timeout.
//!
//! Grounded on `buffer_manager.h`/`.cc`'s `FrameLockManager` and
//! `LockManager` classes for the grant/wait/upgrade state machine, and on
//! the teacher's `transaction/wait_for_graph.rs` for the waits-for graph's
//! cycle check.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::page::PageId;

pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct Lock {
    txn_id: u64,
    mode: LockMode,
}

/// Per-page lock state: who holds it, who is waiting, and a condvar to
/// wake waiters on release or upgrade.
struct FrameLockManager {
    mutex: Mutex<FrameLockState>,
    cv: Condvar,
}

#[derive(Default)]
struct FrameLockState {
    granted: Vec<Lock>,
    waiting: Vec<u64>,
}

impl FrameLockManager {
    fn new() -> Self {
        FrameLockManager {
            mutex: Mutex::new(FrameLockState::default()),
            cv: Condvar::new(),
        }
    }

    fn has_lock(&self, txn_id: u64) -> bool {
        let state = self.mutex.lock().unwrap();
        state.granted.iter().any(|l| l.txn_id == txn_id)
    }

    fn has_exclusive_lock(&self, txn_id: u64) -> bool {
        let state = self.mutex.lock().unwrap();
        state
            .granted
            .iter()
            .any(|l| l.txn_id == txn_id && l.mode == LockMode::Exclusive)
    }

    fn has_shared_lock(&self, txn_id: u64) -> bool {
        let state = self.mutex.lock().unwrap();
        state
            .granted
            .iter()
            .any(|l| l.txn_id == txn_id && l.mode == LockMode::Shared)
    }

    fn can_upgrade_lock(&self, txn_id: u64) -> bool {
        let state = self.mutex.lock().unwrap();
        state.granted.len() == 1 && state.granted[0].txn_id == txn_id
    }

    /// Blocks the calling thread (releasing the internal mutex while
    /// waiting) until `mode` can be granted to `txn_id` or `timeout`
    /// elapses. Returns whether the lock was granted.
    fn grant_lock(&self, txn_id: u64, mode: LockMode, timeout: Duration) -> bool {
        let mut state = self.mutex.lock().unwrap();

        if let Some(existing) = state.granted.iter().position(|l| l.txn_id == txn_id) {
            let existing_mode = state.granted[existing].mode;
            if existing_mode == mode || (existing_mode == LockMode::Exclusive && mode == LockMode::Shared) {
                return true;
            }
            // Shared -> Exclusive upgrade.
            if state.granted.len() == 1 {
                state.granted[existing].mode = LockMode::Exclusive;
                return true;
            }
            let deadline = Instant::now() + timeout;
            loop {
                if state.granted.len() == 1 && state.granted[0].txn_id == txn_id {
                    state.granted[0].mode = LockMode::Exclusive;
                    return true;
                }
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, timeout_result) =
                    self.cv.wait_timeout(state, deadline - now).unwrap();
                state = guard;
                if timeout_result.timed_out() && !(state.granted.len() == 1 && state.granted[0].txn_id == txn_id) {
                    return false;
                }
            }
        }

        let can_grant = match mode {
            LockMode::Exclusive => state.granted.is_empty(),
            LockMode::Shared => !state
                .granted
                .iter()
                .any(|l| l.mode == LockMode::Exclusive && l.txn_id != txn_id),
        };

        if can_grant {
            state.granted.push(Lock { txn_id, mode });
            return true;
        }

        state.waiting.push(txn_id);
        let deadline = Instant::now() + timeout;
        let result = loop {
            let satisfied = match mode {
                LockMode::Exclusive => state.granted.iter().all(|l| l.txn_id == txn_id),
                LockMode::Shared => !state
                    .granted
                    .iter()
                    .any(|l| l.mode == LockMode::Exclusive && l.txn_id != txn_id),
            };
            if satisfied {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let (guard, timeout_result) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if timeout_result.timed_out() {
                let satisfied = match mode {
                    LockMode::Exclusive => state.granted.iter().all(|l| l.txn_id == txn_id),
                    LockMode::Shared => !state
                        .granted
                        .iter()
                        .any(|l| l.mode == LockMode::Exclusive && l.txn_id != txn_id),
                };
                break satisfied;
            }
        };

        state.waiting.retain(|&id| id != txn_id);

        if !result {
            return false;
        }
        if !state.granted.iter().any(|l| l.txn_id == txn_id) {
            state.granted.push(Lock { txn_id, mode });
        }
        true
    }

    fn release_lock(&self, txn_id: u64) {
        let mut state = self.mutex.lock().unwrap();
        state.granted.retain(|l| l.txn_id != txn_id);
        drop(state);
        self.cv.notify_all();
    }
}

/// The waits-for graph used for deadlock detection. Grounded on the
/// teacher's `transaction/wait_for_graph.rs`.
#[derive(Default)]
struct WaitForGraph {
    graph: HashMap<u64, HashSet<u64>>,
}

impl WaitForGraph {
    fn new() -> Self {
        WaitForGraph { graph: HashMap::new() }
    }

    fn set_waiting_for(&mut self, txn_id: u64, waiting_for: u64) {
        self.graph.entry(txn_id).or_insert_with(HashSet::new).insert(waiting_for);
    }

    fn remove_transaction(&mut self, txn_id: u64) {
        self.graph.remove(&txn_id);
        for waiters in self.graph.values_mut() {
            waiters.remove(&txn_id);
        }
    }

    fn exists_cycle_from(&self, start: u64) -> bool {
        let mut visited = HashSet::new();
        self.has_cycle(start, start, &mut visited)
    }

    fn has_cycle(&self, start: u64, current: u64, visited: &mut HashSet<u64>) -> bool {
        if current == start && !visited.is_empty() {
            return true;
        }
        if visited.contains(&current) {
            return false;
        }
        visited.insert(current);
        if let Some(waiting_for) = self.graph.get(&current) {
            for &next in waiting_for {
                if self.has_cycle(start, next, visited) {
                    return true;
                }
            }
        }
        visited.remove(&current);
        false
    }
}

struct LockManagerState {
    txn_locks: HashMap<u64, HashSet<PageId>>,
    waiting_graph: WaitForGraph,
}

/// The global lock manager: one `FrameLockManager` per locked page, plus
/// the transaction -> held-pages index and the waits-for graph used for
/// deadlock detection.
pub struct LockManager {
    page_locks: Mutex<HashMap<PageId, std::sync::Arc<FrameLockManager>>>,
    state: Mutex<LockManagerState>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        LockManager {
            page_locks: Mutex::new(HashMap::new()),
            state: Mutex::new(LockManagerState {
                txn_locks: HashMap::new(),
                waiting_graph: WaitForGraph::new(),
            }),
            timeout,
        }
    }

    pub fn with_default_timeout() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    fn frame_lock_manager(&self, page_id: PageId) -> std::sync::Arc<FrameLockManager> {
        let mut page_locks = self.page_locks.lock().unwrap();
        page_locks
            .entry(page_id)
            .or_insert_with(|| std::sync::Arc::new(FrameLockManager::new()))
            .clone()
    }

    /// Acquires `mode` on `page_id` for `txn_id`, blocking until granted,
    /// a deadlock is detected, or the global timeout elapses. Returns
    /// `Error::TxnAbort` in the latter two cases.
    pub fn acquire_lock(&self, txn_id: u64, page_id: PageId, mode: LockMode) -> Result<()> {
        let flm = self.frame_lock_manager(page_id);

        if flm.has_lock(txn_id) {
            if mode == LockMode::Shared || flm.has_exclusive_lock(txn_id) {
                return Ok(());
            }
            if flm.can_upgrade_lock(txn_id) {
                if flm.grant_lock(txn_id, mode, self.timeout) {
                    let mut state = self.state.lock().unwrap();
                    state.txn_locks.entry(txn_id).or_insert_with(HashSet::new).insert(page_id);
                    return Ok(());
                }
                warn!("txn {} timed out upgrading lock on page {}", txn_id, page_id);
                return Err(Error::TxnAbort);
            }
        }

        let mut conflict_exists = false;
        let mut lock_holders = HashSet::new();
        {
            let state = self.state.lock().unwrap();
            for (&holder, pages) in state.txn_locks.iter() {
                if holder != txn_id && pages.contains(&page_id) {
                    lock_holders.insert(holder);
                    if mode == LockMode::Exclusive || flm.has_exclusive_lock(holder) {
                        conflict_exists = true;
                    }
                }
            }
        }

        if conflict_exists {
            for holder in &lock_holders {
                if self.check_deadlock(txn_id, *holder) {
                    warn!("deadlock detected: txn {} waiting for txn {}", txn_id, holder);
                    return Err(Error::TxnAbort);
                }
            }

            if !flm.grant_lock(txn_id, mode, self.timeout) {
                warn!("txn {} timed out acquiring lock on page {}", txn_id, page_id);
                return Err(Error::TxnAbort);
            }

            let mut state = self.state.lock().unwrap();
            state.txn_locks.entry(txn_id).or_insert_with(HashSet::new).insert(page_id);
            state.waiting_graph.remove_transaction(txn_id);
            return Ok(());
        }

        if flm.grant_lock(txn_id, mode, self.timeout) {
            let mut state = self.state.lock().unwrap();
            state.txn_locks.entry(txn_id).or_insert_with(HashSet::new).insert(page_id);
            debug!("txn {} granted {:?} on page {}", txn_id, mode, page_id);
            return Ok(());
        }

        Err(Error::TxnAbort)
    }

    fn check_deadlock(&self, txn_id: u64, waiting_for: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        state.waiting_graph.set_waiting_for(txn_id, waiting_for);
        let has_deadlock = state.waiting_graph.exists_cycle_from(txn_id);
        if has_deadlock {
            state.waiting_graph.remove_transaction(txn_id);
        }
        has_deadlock
    }

    pub fn has_exclusive_locks_on_page(&self, page_id: PageId, txn_id: u64) -> bool {
        let flm = self.frame_lock_manager(page_id);
        let state = self.state.lock().unwrap();
        for (&holder, pages) in state.txn_locks.iter() {
            if holder != txn_id && pages.contains(&page_id) && flm.has_exclusive_lock(holder) {
                return true;
            }
        }
        false
    }

    pub fn release_lock(&self, txn_id: u64, page_id: PageId) {
        let flm = self.frame_lock_manager(page_id);
        flm.release_lock(txn_id);

        let mut state = self.state.lock().unwrap();
        if let Some(pages) = state.txn_locks.get_mut(&txn_id) {
            pages.remove(&page_id);
            if pages.is_empty() {
                state.txn_locks.remove(&txn_id);
            }
        }
        state.waiting_graph.remove_transaction(txn_id);
    }

    pub fn release_all_locks(&self, txn_id: u64) {
        let pages: Vec<PageId> = {
            let state = self.state.lock().unwrap();
            state
                .txn_locks
                .get(&txn_id)
                .map(|pages| pages.iter().copied().collect())
                .unwrap_or_default()
        };
        for page_id in pages {
            self.release_lock(txn_id, page_id);
        }
    }

    pub fn has_lock(&self, txn_id: u64, page_id: PageId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .txn_locks
            .get(&txn_id)
            .map(|pages| pages.contains(&page_id))
            .unwrap_or(false)
    }

    pub fn page_ids_for_txn(&self, txn_id: u64) -> HashSet<PageId> {
        let state = self.state.lock().unwrap();
        state.txn_locks.get(&txn_id).cloned().unwrap_or_default()
    }
}
