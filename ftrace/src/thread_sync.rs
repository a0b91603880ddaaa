//! Handshake state between the controller and its per-CPU workers.
//!
//! One instance exists per controller, shared with every worker. All
//! fields are read and written only under the mutex; the critical sections
//! never perform I/O.
use std::sync::{Condvar, Mutex};

use ferrotrace_base::CpuSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Run,
    Flush,
    Quit,
}

pub struct ThreadSyncState {
    pub cmd: Cmd,
    /// Monotonic command counter; workers compare it against the last id
    /// they served to tell a new command from a spurious wakeup.
    pub cmd_id: u64,
    /// Bumped every time the readers are (re)started; stale drain tasks
    /// from a previous generation are discarded.
    pub generation: u64,
    /// Set by a worker after it moved data; cleared by the controller
    /// before each drain.
    pub cpus_to_drain: CpuSet,
    /// Set by each worker after it drained its kernel pipe for a flush.
    pub flush_acks: CpuSet,
}

pub struct ThreadSync {
    pub state: Mutex<ThreadSyncState>,
    pub cond: Condvar,
}

impl Default for ThreadSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ThreadSyncState {
                cmd: Cmd::Run,
                cmd_id: 0,
                generation: 0,
                cpus_to_drain: CpuSet::new(),
                flush_acks: CpuSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Publishes a new command. The caller is responsible for also
    /// interrupting workers stuck in blocking syscalls. Quit is final for
    /// one generation of workers; the controller joins them all before
    /// issuing Run for the next.
    pub fn issue(&self, cmd: Cmd) {
        {
            let mut state = self.state.lock().unwrap();
            state.cmd = cmd;
            state.cmd_id += 1;
        }
        self.cond.notify_all();
    }

    /// Worker side: blocks until `cmd_id` advances past `last_cmd_id`,
    /// then returns the new `(cmd, cmd_id)`.
    pub fn wait_for_new_cmd(&self, last_cmd_id: u64) -> (Cmd, u64) {
        let mut state = self.state.lock().unwrap();
        while state.cmd_id == last_cmd_id {
            state = self.cond.wait(state).unwrap();
        }
        (state.cmd, state.cmd_id)
    }
}
