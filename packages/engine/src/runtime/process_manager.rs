// packages/engine/src/runtime/process_manager.rs
//! Process-backed agent runtime
//!
//! Each handle owns one long-lived worker process. Requests are written to
//! the worker's stdin as a single JSON line followed by an `__END__` line;
//! the worker answers with its output followed by `__END__`. A response that
//! starts with an `__ERROR__` line is reported as an execution failure.
//!
//! Resource usage is sampled from `/proc` (Linux only). Termination sends
//! SIGTERM first and escalates to SIGKILL after the grace period.

use crate::runtime::agent_runtime::{AgentConfig, AgentRuntime, ResourceUsage, RuntimeHandle};
use crate::runtime::resource_limiter::SecurityConstraints;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const END_MARKER: &str = "__END__";
const ERROR_MARKER: &str = "__ERROR__";

/// Configuration for spawning a worker process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: Option<String>,
    pub env_vars: Vec<(String, String)>,
}

impl From<&RuntimeConfig> for SpawnConfig {
    fn from(config: &RuntimeConfig) -> Self {
        let mut env_vars: Vec<(String, String)> = config
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env_vars.sort();

        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            work_dir: config.work_dir.clone(),
            env_vars,
        }
    }
}

struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    ticks: u64,
    at: Instant,
}

/// One spawned worker
struct WorkerProcess {
    pid: u32,
    child: Mutex<Child>,
    io: Mutex<WorkerIo>,
    last_cpu: parking_lot::Mutex<Option<CpuSample>>,
    /// Set when a request was abandoned mid-exchange; the pipe is out of sync
    poisoned: AtomicBool,
}

/// Agent runtime spawning one OS process per handle
pub struct ProcessRuntime {
    spawn: SpawnConfig,
    execution_timeout: Duration,
    executable: parking_lot::Mutex<Option<PathBuf>>,
    workers: DashMap<String, Arc<WorkerProcess>>,
    next_id: AtomicU64,
}

impl ProcessRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            spawn: SpawnConfig::from(config),
            execution_timeout: config.execution_timeout(),
            executable: parking_lot::Mutex::new(None),
            workers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Resolve the worker executable through PATH (cached)
    fn find_executable(&self) -> Result<PathBuf> {
        let mut cached = self.executable.lock();
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }

        match which::which(&self.spawn.command) {
            Ok(path) => {
                info!("Found {} at {:?}", self.spawn.command, path);
                *cached = Some(path.clone());
                Ok(path)
            }
            Err(e) => Err(EngineError::ProcessSpawnFailed(format!(
                "Executable '{}' not found in PATH: {}",
                self.spawn.command, e
            ))),
        }
    }

    fn spawn_worker(
        &self,
        config: &AgentConfig,
        constraints: &SecurityConstraints,
    ) -> Result<Child> {
        let executable = self.find_executable()?;
        debug!("Spawning worker for {}: {:?}", config.name, executable);

        let mut command = Command::new(executable);
        command.args(&self.spawn.args);

        if let Some(work_dir) = &self.spawn.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &self.spawn.env_vars {
            command.env(key, value);
        }

        command
            .env("AGENT_NAME", &config.name)
            .env("AGENT_CAPABILITY", config.capability.as_str())
            .env("AGENT_CONFIG", serde_json::to_string(config)?)
            .env("AGENT_CONSTRAINTS", serde_json::to_string(constraints)?)
            .env("AGENT_NETWORK_ACCESS", constraints.network_access.to_string())
            .env("AGENT_FILE_ACCESS", constraints.file_access.to_string());

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("Failed to spawn process: {}", e)))
    }

    fn worker(&self, handle: &RuntimeHandle) -> Result<Arc<WorkerProcess>> {
        self.workers
            .get(&handle.id)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| EngineError::not_found("runtime handle", &handle.id))
    }

    /// Number of live worker processes
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Check if a process is running
    pub fn is_running(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    async fn exchange(io: &mut WorkerIo, input: &serde_json::Value) -> Result<serde_json::Value> {
        let line = serde_json::to_string(input)?;

        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::RuntimeError(format!("Failed to write to stdin: {}", e)))?;
        io.stdin
            .write_all(format!("\n{}\n", END_MARKER).as_bytes())
            .await
            .map_err(|e| EngineError::RuntimeError(format!("Failed to write delimiter: {}", e)))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| EngineError::RuntimeError(format!("Failed to flush stdin: {}", e)))?;

        let mut output = String::new();
        let mut line = String::new();
        let mut failed = false;

        loop {
            line.clear();
            let read = io
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| EngineError::RuntimeError(format!("Read error: {}", e)))?;

            if read == 0 {
                return Err(EngineError::Execution(
                    "worker exited before completing the request".to_string(),
                ));
            }

            let trimmed = line.trim_end();
            if trimmed == END_MARKER {
                break;
            }
            if output.is_empty() && !failed && trimmed == ERROR_MARKER {
                failed = true;
                continue;
            }
            output.push_str(&line);
        }

        let output = output.trim();
        if failed {
            return Err(EngineError::Execution(output.to_string()));
        }

        // Non-JSON output is passed through as a string
        Ok(serde_json::from_str(output)
            .unwrap_or_else(|_| serde_json::Value::String(output.to_string())))
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn create_handle(
        &self,
        config: &AgentConfig,
        constraints: &SecurityConstraints,
    ) -> Result<RuntimeHandle> {
        let mut child = self.spawn_worker(config, constraints)?;

        let pid = child
            .id()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Process exited immediately".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdout".into()))?;

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = RuntimeHandle::new(format!("proc-{}-{}", pid, seq)).with_pid(pid);

        self.workers.insert(
            handle.id.clone(),
            Arc::new(WorkerProcess {
                pid,
                child: Mutex::new(child),
                io: Mutex::new(WorkerIo {
                    stdin,
                    stdout: BufReader::new(stdout),
                }),
                last_cpu: parking_lot::Mutex::new(None),
                poisoned: AtomicBool::new(false),
            }),
        );

        debug!("Worker process spawned with PID: {}", pid);
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &RuntimeHandle,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let worker = self.worker(handle)?;

        // One request in flight per worker
        let mut io = worker.io.lock().await;
        if worker.poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::RuntimeError(format!(
                "worker {} was killed after an abandoned request",
                worker.pid
            )));
        }

        match tokio::time::timeout(self.execution_timeout, Self::exchange(&mut io, input)).await {
            Ok(result) => result,
            Err(_) => {
                // A late reply would be read as the next request's output
                worker.poisoned.store(true, Ordering::SeqCst);
                warn!(
                    "Worker {} exceeded {:?}, killing it",
                    worker.pid, self.execution_timeout
                );
                if let Err(e) = worker.child.lock().await.start_kill() {
                    debug!("Kill of PID {} failed (already exited?): {}", worker.pid, e);
                }
                Err(EngineError::ExecutionTimeout)
            }
        }
    }

    async fn probe(&self, handle: &RuntimeHandle) -> Result<ResourceUsage> {
        let worker = self.worker(handle)?;

        if !Self::is_running(worker.pid) {
            return Err(EngineError::RuntimeError(format!(
                "worker process {} is not running",
                worker.pid
            )));
        }

        let memory_mb = proc_stats::resident_memory_mb(worker.pid).await?;
        let ticks = proc_stats::cpu_ticks(worker.pid).await?;
        let now = Instant::now();

        let cpu_percent = {
            let mut last = worker.last_cpu.lock();
            let percent = match *last {
                Some(previous) => {
                    let elapsed = now.duration_since(previous.at).as_secs_f64();
                    if elapsed > 0.0 {
                        let delta = ticks.saturating_sub(previous.ticks) as f64;
                        delta / proc_stats::clock_ticks_per_sec() / elapsed * 100.0
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            *last = Some(CpuSample { ticks, at: now });
            percent
        };

        Ok(ResourceUsage {
            cpu_percent,
            memory_mb,
        })
    }

    async fn terminate(&self, handle: &RuntimeHandle, grace_period: Duration) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some((_, worker)) = self.workers.remove(&handle.id) else {
            return Err(EngineError::not_found("runtime handle", &handle.id));
        };

        let mut child = worker.child.lock().await;

        // Try SIGTERM first (graceful)
        debug!("Sending SIGTERM to PID {}", worker.pid);
        if let Err(e) = kill(Pid::from_raw(worker.pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to PID {} failed (already exited?): {}", worker.pid, e);
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process {} exited with status: {}", worker.pid, status);
            }
            Ok(Err(e)) => {
                return Err(EngineError::RuntimeError(format!(
                    "Error waiting for process {}: {}",
                    worker.pid, e
                )));
            }
            Err(_) => {
                warn!(
                    "Process {} did not exit within {:?}, sending SIGKILL",
                    worker.pid, grace_period
                );
                child.kill().await.map_err(|e| {
                    EngineError::RuntimeError(format!("Failed to send SIGKILL: {}", e))
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod proc_stats {
    use crate::utils::errors::{EngineError, Result};
    use nix::unistd::{sysconf, SysconfVar};

    fn sysconf_or(var: SysconfVar, fallback: f64) -> f64 {
        match sysconf(var) {
            Ok(Some(value)) if value > 0 => value as f64,
            _ => fallback,
        }
    }

    pub fn page_size_bytes() -> f64 {
        sysconf_or(SysconfVar::PAGE_SIZE, 4096.0)
    }

    pub fn clock_ticks_per_sec() -> f64 {
        sysconf_or(SysconfVar::CLK_TCK, 100.0)
    }

    pub async fn resident_memory_mb(pid: u32) -> Result<f64> {
        let statm = tokio::fs::read_to_string(format!("/proc/{}/statm", pid)).await?;
        let resident_pages: f64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| EngineError::RuntimeError(format!("malformed statm for {}", pid)))?;

        Ok(resident_pages * page_size_bytes() / (1024.0 * 1024.0))
    }

    /// utime + stime of the process in clock ticks
    pub async fn cpu_ticks(pid: u32) -> Result<u64> {
        let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await?;
        parse_cpu_ticks(&stat)
            .ok_or_else(|| EngineError::RuntimeError(format!("malformed stat for {}", pid)))
    }

    pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
        // The command name may contain spaces; fields are counted after ')'
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }
}

#[cfg(not(target_os = "linux"))]
mod proc_stats {
    use crate::utils::errors::{EngineError, Result};

    pub fn clock_ticks_per_sec() -> f64 {
        100.0
    }

    pub async fn resident_memory_mb(_pid: u32) -> Result<f64> {
        Err(EngineError::RuntimeError(
            "resource probing is not supported on this platform".to_string(),
        ))
    }

    pub async fn cpu_ticks(_pid: u32) -> Result<u64> {
        Err(EngineError::RuntimeError(
            "resource probing is not supported on this platform".to_string(),
        ))
    }
}
