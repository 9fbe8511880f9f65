use once_cell::sync::Lazy;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Default stack size of a fiber, 128KB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Upper bound of a single reactor wait, in ms.
pub const DEFAULT_MAX_WAIT_MS: u64 = 5000;

/// Default `connect` timeout, in ms.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Initial length of the descriptor tables.
pub const DEFAULT_FD_TABLE_SIZE: usize = 64;

fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Process wide tunables.
///
/// Values are read from `FIBERIO_*` env vars on first access and can be changed later
/// through the setters; changes apply to objects created afterwards.
#[derive(Debug)]
pub struct Config {
    stack_size: AtomicUsize,
    worker_threads: AtomicUsize,
    max_wait_ms: AtomicU64,
    connect_timeout_ms: AtomicU64,
    fd_table_size: AtomicUsize,
    bind_cpu: AtomicBool,
    tickle_on_affinity_skip: AtomicBool,
}

static INSTANCE: Lazy<Config> = Lazy::new(Config::from_env);

impl Config {
    /// Get the process wide instance.
    #[must_use]
    pub fn get_instance() -> &'static Config {
        &INSTANCE
    }

    fn from_env() -> Self {
        Config {
            stack_size: AtomicUsize::new(env_get("FIBERIO_STACK_SIZE", DEFAULT_STACK_SIZE)),
            // 0 until asked for, counting cpus opens files
            worker_threads: AtomicUsize::new(env_get("FIBERIO_WORKER_THREADS", 0)),
            max_wait_ms: AtomicU64::new(env_get("FIBERIO_MAX_WAIT_MS", DEFAULT_MAX_WAIT_MS)),
            connect_timeout_ms: AtomicU64::new(env_get(
                "FIBERIO_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            fd_table_size: AtomicUsize::new(env_get(
                "FIBERIO_FD_TABLE_SIZE",
                DEFAULT_FD_TABLE_SIZE,
            )),
            bind_cpu: AtomicBool::new(env_get_bool("FIBERIO_BIND_CPU", false)),
            tickle_on_affinity_skip: AtomicBool::new(env_get_bool(
                "FIBERIO_TICKLE_ON_AFFINITY_SKIP",
                true,
            )),
        }
    }

    /// Stack size used when a fiber is created with size 0.
    pub fn get_stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Acquire)
    }

    /// Number of worker threads a scheduler gets by default, the cpu count if unset.
    pub fn get_worker_threads(&self) -> usize {
        match self.worker_threads.load(Ordering::Acquire) {
            0 => num_cpus::get().max(1),
            threads => threads,
        }
    }

    /// Cap of one reactor wait.
    pub fn get_max_wait_ms(&self) -> u64 {
        self.max_wait_ms.load(Ordering::Acquire)
    }

    /// Timeout of a hooked `connect`.
    pub fn get_connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms.load(Ordering::Acquire)
    }

    /// Initial descriptor table length.
    pub fn get_fd_table_size(&self) -> usize {
        self.fd_table_size.load(Ordering::Acquire).max(1)
    }

    /// Pin worker threads to cores.
    pub fn is_bind_cpu(&self) -> bool {
        self.bind_cpu.load(Ordering::Acquire)
    }

    /// Wake peers when a worker skips a task pinned to another worker.
    pub fn is_tickle_on_affinity_skip(&self) -> bool {
        self.tickle_on_affinity_skip.load(Ordering::Acquire)
    }

    #[allow(missing_docs)]
    pub fn set_stack_size(&self, stack_size: usize) -> &Self {
        self.stack_size.store(stack_size, Ordering::Release);
        self
    }

    #[allow(missing_docs)]
    pub fn set_worker_threads(&self, worker_threads: usize) -> &Self {
        self.worker_threads.store(worker_threads, Ordering::Release);
        self
    }

    #[allow(missing_docs)]
    pub fn set_max_wait_ms(&self, max_wait_ms: u64) -> &Self {
        self.max_wait_ms.store(max_wait_ms, Ordering::Release);
        self
    }

    #[allow(missing_docs)]
    pub fn set_connect_timeout_ms(&self, connect_timeout_ms: u64) -> &Self {
        self.connect_timeout_ms
            .store(connect_timeout_ms, Ordering::Release);
        self
    }

    #[allow(missing_docs)]
    pub fn set_fd_table_size(&self, fd_table_size: usize) -> &Self {
        self.fd_table_size.store(fd_table_size, Ordering::Release);
        self
    }

    #[allow(missing_docs)]
    pub fn set_bind_cpu(&self, bind_cpu: bool) -> &Self {
        self.bind_cpu.store(bind_cpu, Ordering::Release);
        self
    }

    #[allow(missing_docs)]
    pub fn set_tickle_on_affinity_skip(&self, tickle: bool) -> &Self {
        self.tickle_on_affinity_skip.store(tickle, Ordering::Release);
        self
    }
}
