//! Periodic-task scheduler (`§3`, `§4.1`, `§5`): fixed-priority,
//! rate-monotonic by convention, one OS thread per registered task,
//! watchdog-patted once per cycle immediately before the task body runs.
//!
//! Grounded on the original `rt_scheduler.c`'s `TaskControlBlock`/
//! `task_wrapper` pair (absolute-time sleep, EMA stats update
//! `(avg*7+exec)/8`). Diverges from it in one respect: the original re-fires
//! immediately on overrun (catch-up); this scheduler never catches up — it
//! advances to the next future release boundary and counts a miss for every
//! skipped release along the way.

use ecu_error::{ClassifiedError, ErrorKind};
use ecu_platform::Watchdog;
use ecu_time::Clock;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

ecu_ringbuf::ringbuf!(SCHED_RINGBUF, SchedulerEvent, 64, SchedulerEvent::Idle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Idle,
    Activated { priority: u8 },
    DeadlineMiss { priority: u8 },
    ReleaseSkipped { priority: u8, count: u32 },
    TaskPanicked { priority: u8 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("priority 0 is reserved for interrupt-level handlers")]
    ReservedPriority,
    #[error("deadline_us ({deadline_us}) exceeds period_us ({period_us})")]
    DeadlineExceedsPeriod { deadline_us: u64, period_us: u64 },
    #[error("a task named {0:?} is already registered")]
    DuplicateName(String),
    #[error("a task at priority {0} is already registered")]
    DuplicatePriority(u8),
    #[error("cannot register tasks after the scheduler has started")]
    AlreadyRunning,
    #[error("no task named {0:?} is registered")]
    UnknownTask(String),
}

impl ClassifiedError for SchedulerError {
    fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::ReservedPriority
            | SchedulerError::DeadlineExceedsPeriod { .. }
            | SchedulerError::DuplicateName(_)
            | SchedulerError::DuplicatePriority(_) => ErrorKind::Configuration,
            SchedulerError::AlreadyRunning | SchedulerError::UnknownTask(_) => {
                ErrorKind::Transient
            }
        }
    }
}

/// A periodic task, registered before the scheduler starts (`§3`).
///
/// Invariant: `deadline_us <= period_us`, enforced by `create_task`.
pub struct TaskConfig {
    pub name: String,
    pub period_us: u64,
    pub deadline_us: u64,
    /// Fixed priority; lower number is higher priority. 0 is reserved for
    /// interrupt-level handlers and is never admitted here.
    pub priority: u8,
    pub entry: Box<dyn FnMut() + Send + 'static>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TaskStats {
    pub activation_count: u64,
    pub deadline_misses: u64,
    pub preemption_count: u64,
    pub execution_time_min_us: u64,
    pub execution_time_max_us: u64,
    pub execution_time_avg_us: u64,
}

impl TaskStats {
    fn record_activation(&mut self, exec_us: u64) {
        self.activation_count += 1;
        if self.execution_time_min_us == 0 || exec_us < self.execution_time_min_us {
            self.execution_time_min_us = exec_us;
        }
        if exec_us > self.execution_time_max_us {
            self.execution_time_max_us = exec_us;
        }
        self.execution_time_avg_us = (self.execution_time_avg_us * 7 + exec_us) / 8;
    }
}

struct TaskRecord {
    name: String,
    period_us: u64,
    deadline_us: u64,
    priority: u8,
    entry: Mutex<Option<Box<dyn FnMut() + Send + 'static>>>,
    stats: Arc<Mutex<TaskStats>>,
}

type RunningPriorities = Arc<Mutex<Vec<(u8, Arc<Mutex<TaskStats>>)>>>;

/// Fixed-priority preemptive scheduler: one OS thread per registered task
/// (`§5`: "parallel threads at the OS level... bound to fixed priorities").
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    watchdog: Arc<Watchdog>,
    tasks: Mutex<Vec<Arc<TaskRecord>>>,
    running_priorities: RunningPriorities,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, watchdog: Arc<Watchdog>) -> Self {
        Scheduler {
            clock,
            watchdog,
            tasks: Mutex::new(Vec::new()),
            running_priorities: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Registers a periodic task. Must be called before [`start`](Self::start).
    pub fn create_task(&self, config: TaskConfig) -> Result<(), SchedulerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        if config.priority == 0 {
            return Err(SchedulerError::ReservedPriority);
        }
        if config.deadline_us > config.period_us {
            return Err(SchedulerError::DeadlineExceedsPeriod {
                deadline_us: config.deadline_us,
                period_us: config.period_us,
            });
        }
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.iter().any(|t| t.name == config.name) {
            return Err(SchedulerError::DuplicateName(config.name));
        }
        if tasks.iter().any(|t| t.priority == config.priority) {
            return Err(SchedulerError::DuplicatePriority(config.priority));
        }
        tasks.push(Arc::new(TaskRecord {
            name: config.name,
            period_us: config.period_us,
            deadline_us: config.deadline_us,
            priority: config.priority,
            entry: Mutex::new(Some(config.entry)),
            stats: Arc::new(Mutex::new(TaskStats::default())),
        }));
        Ok(())
    }

    /// Starts one OS thread per registered task and the watchdog monitor.
    /// Idempotent: a second call while already running is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        self.watchdog.start();
        let tasks = self.tasks.lock().unwrap();
        let mut handles = self.handles.lock().unwrap();
        for task in tasks.iter() {
            let entry = task
                .entry
                .lock()
                .unwrap()
                .take()
                .expect("task entry already taken");
            let clock = Arc::clone(&self.clock);
            let watchdog = Arc::clone(&self.watchdog);
            let running = Arc::clone(&self.running);
            let running_priorities = Arc::clone(&self.running_priorities);
            let stats = Arc::clone(&task.stats);
            let priority = task.priority;
            let period_us = task.period_us;
            let deadline_us = task.deadline_us;
            let handle = std::thread::Builder::new()
                .name(task.name.clone())
                .spawn(move || {
                    run_task_loop(
                        entry,
                        clock,
                        watchdog,
                        running,
                        running_priorities,
                        stats,
                        priority,
                        period_us,
                        deadline_us,
                    )
                })
                .expect("failed to spawn task thread");
            handles.push(handle);
        }
    }

    /// Signals every task thread to stop at its next release boundary and
    /// joins them, then stops the watchdog monitor (`§5`: "cooperative...
    /// each task observes the flag at its next release boundary").
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        self.watchdog.stop();
    }

    pub fn get_task_stats(&self, name: &str) -> Result<TaskStats, SchedulerError> {
        let tasks = self.tasks.lock().unwrap();
        let task = tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        Ok(*task.stats.lock().unwrap())
    }
}

#[allow(clippy::too_many_arguments)]
fn run_task_loop(
    mut entry: Box<dyn FnMut() + Send>,
    clock: Arc<dyn Clock>,
    watchdog: Arc<Watchdog>,
    running: Arc<AtomicBool>,
    running_priorities: RunningPriorities,
    stats: Arc<Mutex<TaskStats>>,
    priority: u8,
    period_us: u64,
    deadline_us: u64,
) {
    let mut next_release = clock.now_us() + period_us;
    while running.load(Ordering::SeqCst) {
        clock.sleep_until_us(next_release);
        if !running.load(Ordering::SeqCst) {
            return;
        }

        watchdog.pat();
        ecu_ringbuf::ringbuf_entry!(SCHED_RINGBUF, SchedulerEvent::Activated { priority });

        // Any lower-priority (higher-numbered) task still mid-activation is
        // considered preempted by this release (`§3`: "preemption count").
        {
            let running_now = running_priorities.lock().unwrap();
            for (other_priority, other_stats) in running_now.iter() {
                if *other_priority > priority {
                    other_stats.lock().unwrap().preemption_count += 1;
                }
            }
        }
        running_priorities
            .lock()
            .unwrap()
            .push((priority, Arc::clone(&stats)));

        let start = clock.now_us();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| entry()));
        let end = clock.now_us();

        running_priorities.lock().unwrap().retain(|(p, _)| *p != priority);

        if result.is_err() {
            ecu_ringbuf::ringbuf_entry!(SCHED_RINGBUF, SchedulerEvent::TaskPanicked { priority });
        }

        let exec_us = end.saturating_sub(start);
        let deadline_missed_this_cycle = exec_us > deadline_us;
        {
            let mut s = stats.lock().unwrap();
            s.record_activation(exec_us);
            if deadline_missed_this_cycle {
                s.deadline_misses += 1;
            }
        }
        if deadline_missed_this_cycle {
            ecu_ringbuf::ringbuf_entry!(SCHED_RINGBUF, SchedulerEvent::DeadlineMiss { priority });
        }

        // Never catch up: advance to the next future boundary, counting a
        // miss for every release skipped along the way.
        next_release += period_us;
        let now = clock.now_us();
        let mut skipped = 0u32;
        while next_release <= now {
            next_release += period_us;
            skipped += 1;
        }
        if skipped > 0 {
            stats.lock().unwrap().deadline_misses += skipped as u64;
            ecu_ringbuf::ringbuf_entry!(
                SCHED_RINGBUF,
                SchedulerEvent::ReleaseSkipped {
                    priority,
                    count: skipped
                }
            );
        }
    }
}
