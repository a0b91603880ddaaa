//! One worker thread per CPU moving kernel ring-buffer pages into a page
//! pool.
//!
//! The worker prefers `splice()` from the kernel pipe into a local staging
//! pipe (zero-copy page movement) and falls back to plain `read()` after a
//! flush, because a flush must also surface partially filled pages that
//! `splice()` would keep back. A blocking move is interrupted by SIGPIPE
//! from the controller; the handler is a no-op installed once, whose only
//! purpose is to make the syscall fail with EINTR instead of restarting.
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ferrotrace_base::{Pipe, pipe::set_blocking};

use crate::page_pool::PagePool;
use crate::thread_sync::{Cmd, ThreadSync};

/// Throttle tuning. A worker that moved a large burst sleeps
/// `throttle_hi_us`; one whose blocking wait returned almost immediately
/// sleeps `throttle_lo_us`; otherwise it does not sleep at all.
#[derive(Debug, Clone, Copy)]
pub struct CpuReaderConfig {
    pub throttle_hi_us: u64,
    pub throttle_lo_us: u64,
    pub burst_pages: usize,
}

impl Default for CpuReaderConfig {
    fn default() -> Self {
        Self {
            throttle_hi_us: 1000,
            throttle_lo_us: 100,
            burst_pages: 8,
        }
    }
}

/// A blocking wait shorter than this means the kernel side is producing
/// faster than we drain.
const SHORT_BLOCKING_WAIT: Duration = Duration::from_millis(1);

/// Controller-side callbacks, invoked on the worker thread.
pub trait CpuReaderObserver: Send + Sync {
    fn on_cpu_read(&self, cpu: usize, generation: u64);
    fn on_cpu_flush(&self, cpu: usize, generation: u64);
}

extern "C" fn noop_signal_handler(_: libc::c_int) {}

/// Installs the no-op SIGPIPE handler, once, unless the embedder already
/// has a real one.
fn install_sigpipe_handler() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGPIPE, std::ptr::null(), &mut current) != 0 {
            return;
        }
        if current.sa_sigaction == libc::SIG_DFL || current.sa_sigaction == libc::SIG_IGN {
            let mut act: libc::sigaction = std::mem::zeroed();
            act.sa_sigaction = noop_signal_handler as libc::sighandler_t;
            libc::sigaction(libc::SIGPIPE, &act, std::ptr::null_mut());
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Read,
    Splice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveResult {
    Moved,
    /// Empty pipe, interrupted syscall, transient failure or exhausted
    /// pool: skip this cycle and try again on the next wake-up.
    Retry,
    /// The fd went away (EBADF/EPIPE); stop moving until told to quit.
    Closed,
}

pub struct CpuReader {
    cpu: usize,
    pool: Arc<PagePool>,
    // Teardown order matters: the kernel pipe is closed first so no new
    // page move can start, then the worker is interrupted and joined, and
    // only then is the staging pipe closed; closing it under an in-flight
    // splice() can hang forever.
    trace_fd: Option<File>,
    staging: Option<Pipe>,
    worker: Option<JoinHandle<()>>,
    worker_pthread: libc::pthread_t,
}

impl CpuReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cpu: usize,
        generation: u64,
        trace_fd: File,
        page_size: usize,
        pool: Arc<PagePool>,
        thread_sync: Arc<ThreadSync>,
        config: CpuReaderConfig,
        observer: Arc<dyn CpuReaderObserver>,
    ) -> std::io::Result<CpuReader> {
        install_sigpipe_handler();
        set_blocking(trace_fd.as_fd(), true)?;
        let staging = Pipe::create_non_blocking()?;

        let trace_raw = trace_fd.as_raw_fd();
        let staging_rd = staging.rd.as_raw_fd();
        let staging_wr = staging.wr.as_raw_fd();
        let worker_pool = pool.clone();
        let worker_sync = thread_sync.clone();
        let worker = std::thread::Builder::new()
            .name(format!("ftrace.cpu{cpu}"))
            .spawn(move || {
                run_worker_thread(
                    cpu,
                    generation,
                    trace_raw,
                    staging_rd,
                    staging_wr,
                    page_size,
                    &worker_pool,
                    &worker_sync,
                    config,
                    observer.as_ref(),
                );
            })?;
        let worker_pthread = worker.as_pthread_t();

        Ok(CpuReader {
            cpu,
            pool,
            trace_fd: Some(trace_fd),
            staging: Some(staging),
            worker: Some(worker),
            worker_pthread,
        })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Aborts a blocking page move so the worker re-reads the command.
    pub fn interrupt_worker_with_signal(&self) {
        unsafe {
            libc::pthread_kill(self.worker_pthread, libc::SIGPIPE);
        }
    }

    /// Main-thread side: pops every filled page and hands it to `consume`.
    pub fn drain(&self, mut consume: impl FnMut(usize, &[u8])) {
        while let Some(page) = self.pool.pop_contentful_page() {
            consume(self.cpu, page.contents());
            self.pool.free_page(page);
        }
    }
}

impl Drop for CpuReader {
    fn drop(&mut self) {
        // The controller has issued Quit by the time a reader is dropped.
        self.trace_fd.take();
        self.interrupt_worker_with_signal();
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.join()
        {
            log::error!("cpu{} reader thread join failed: {e:?}", self.cpu);
        }
        self.staging.take();
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn classify_error(res: isize, err: i32) -> MoveResult {
    if res == 0 {
        // Ambiguous between "pipe empty" and "output full"; both resolve
        // on the next wake-up.
        return MoveResult::Retry;
    }
    match err {
        libc::EAGAIN | libc::EINTR | libc::ENOMEM | libc::EBUSY => MoveResult::Retry,
        libc::EBADF | libc::EPIPE | libc::EINVAL => MoveResult::Closed,
        _ => {
            log::warn!("unexpected page move errno {err}");
            MoveResult::Retry
        }
    }
}

/// Moves one kernel page into the pool, via the staging pipe when
/// splicing.
#[allow(clippy::too_many_arguments)]
fn move_one_page(
    trace_fd: RawFd,
    staging_rd: RawFd,
    staging_wr: RawFd,
    page_size: usize,
    pool: &PagePool,
    mode: ReadMode,
    block: Block,
) -> MoveResult {
    let Some(mut page) = pool.get_free_page() else {
        return MoveResult::Retry;
    };

    let res = match mode {
        ReadMode::Splice => {
            let mut flags = libc::SPLICE_F_MOVE;
            if block == Block::NonBlocking {
                flags |= libc::SPLICE_F_NONBLOCK;
            }
            let res = unsafe {
                libc::splice(
                    trace_fd,
                    std::ptr::null_mut(),
                    staging_wr,
                    std::ptr::null_mut(),
                    page_size,
                    flags,
                )
            };
            if res > 0 {
                let rdres = unsafe {
                    libc::read(
                        staging_rd,
                        page.data_mut().as_mut_ptr() as *mut libc::c_void,
                        res as usize,
                    )
                };
                debug_assert_eq!(rdres, res);
            }
            res
        }
        ReadMode::Read => {
            if block == Block::NonBlocking {
                let _ = set_blocking(unsafe { BorrowedFd::borrow_raw(trace_fd) }, false);
            }
            let res = unsafe {
                libc::read(
                    trace_fd,
                    page.data_mut().as_mut_ptr() as *mut libc::c_void,
                    page_size,
                )
            };
            if block == Block::NonBlocking {
                let _ = set_blocking(unsafe { BorrowedFd::borrow_raw(trace_fd) }, true);
            }
            res
        }
    };

    if res > 0 {
        pool.push_contentful_page(page, res as usize);
        return MoveResult::Moved;
    }
    let err = errno();
    pool.free_page(page);
    classify_error(res, err)
}

#[allow(clippy::too_many_arguments)]
fn run_worker_thread(
    cpu: usize,
    generation: u64,
    trace_fd: RawFd,
    staging_rd: RawFd,
    staging_wr: RawFd,
    page_size: usize,
    pool: &PagePool,
    thread_sync: &ThreadSync,
    config: CpuReaderConfig,
    observer: &dyn CpuReaderObserver,
) {
    let mut last_cmd_id = 0;
    let mut cur_mode = ReadMode::Splice;
    let move_page = |mode, block| {
        move_one_page(trace_fd, staging_rd, staging_wr, page_size, pool, mode, block)
    };

    loop {
        let (cmd, cmd_id) = thread_sync.wait_for_new_cmd(last_cmd_id);
        last_cmd_id = cmd_id;

        match cmd {
            Cmd::Quit => break,

            Cmd::Run => {
                // The blocking move can fail for several reasons: the
                // controller interrupted us with a signal for a new
                // command, the pool ran dry, or a transient kernel error.
                // In every case we skip the cycle and wait again.
                let wait_start = Instant::now();
                if move_page(cur_mode, Block::Blocking) != MoveResult::Moved {
                    continue;
                }
                let blocking_wait = wait_start.elapsed();

                // A previous flush left us in read mode; go back to
                // splicing as soon as a full page is available again.
                if cur_mode == ReadMode::Read
                    && move_page(ReadMode::Splice, Block::NonBlocking) == MoveResult::Moved
                {
                    cur_mode = ReadMode::Splice;
                }

                let mut moved_pages = 1usize;
                while move_page(cur_mode, Block::NonBlocking) == MoveResult::Moved {
                    moved_pages += 1;
                }

                let throttle_us = if moved_pages >= config.burst_pages {
                    config.throttle_hi_us
                } else if blocking_wait < SHORT_BLOCKING_WAIT {
                    config.throttle_lo_us
                } else {
                    0
                };
                if throttle_us > 0 {
                    std::thread::sleep(Duration::from_micros(throttle_us));
                }

                observer.on_cpu_read(cpu, generation);
            }

            Cmd::Flush => {
                // read() also surfaces the partially filled page that
                // splice() would hold back until full.
                cur_mode = ReadMode::Read;
                while move_page(cur_mode, Block::NonBlocking) == MoveResult::Moved {}
                observer.on_cpu_flush(cpu, generation);
            }
        }
    }
    log::debug!("terminating reader thread for cpu {cpu}");
}
