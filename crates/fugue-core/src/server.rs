// src/server.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{FugueError, FugueResult};
use crate::metrics::WorkerMetrics;
use crate::router::Router;
use crate::syscalls;
use crate::worker::EventLoop;

pub struct Server {
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<WorkerMetrics>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(WorkerMetrics::new()),
        }
    }

    pub fn bind(host: &str, port: u16) -> Self {
        Self::new(ServerConfig {
            host: host.to_string(),
            port,
            ..ServerConfig::default()
        })
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.config.max_payload_size = bytes;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.config.pin_workers = pin;
        self
    }

    /// Share a stop flag with the caller; setting it ends every loop
    /// within one wait timeout.
    pub fn shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start the workers and block until all of them exit.
    pub fn serve(self, router: Router) -> FugueResult<()> {
        self.start(router)?.join()
    }

    /// Bind every worker's listener, then run the loops on their own
    /// threads. Bind failures are reported here, before any thread starts.
    pub fn start(self, router: Router) -> FugueResult<RunningServer> {
        self.config.validate()?;
        syscalls::ignore_sigpipe();

        let cfg = &self.config;
        let mut listeners = Vec::with_capacity(cfg.workers);
        let first = syscalls::create_listen_socket(&cfg.host, cfg.port, cfg.backlog)?;
        // Port 0 picks an ephemeral port; the other workers share it.
        let port = match syscalls::local_port(first) {
            Ok(port) => port,
            Err(e) => {
                syscalls::close_fd(first);
                return Err(e.into());
            }
        };
        listeners.push(first);
        for _ in 1..cfg.workers {
            match syscalls::create_listen_socket(&cfg.host, port, cfg.backlog) {
                Ok(fd) => listeners.push(fd),
                Err(e) => {
                    listeners.iter().copied().for_each(syscalls::close_fd);
                    return Err(e);
                }
            }
        }
        info!(
            "Starting {} workers on {}:{} ({} routes, {} websocket routes)",
            cfg.workers,
            cfg.host,
            port,
            router.http_routes(),
            router.ws_routes()
        );

        let router = Arc::new(router);
        let core_ids = if cfg.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(cfg.workers);
        let mut listeners = listeners.into_iter();
        for i in 0..cfg.workers {
            let Some(listen_fd) = listeners.next() else {
                break;
            };
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let worker_cfg = cfg.clone();
            let router = router.clone();
            let metrics = self.metrics.clone();
            let shutdown = self.shutdown.clone();

            let spawned = thread::Builder::new()
                .name(format!("fugue-worker-{i}"))
                .spawn(move || {
                    if let Some(core) = core_id {
                        if core_affinity::set_for_current(core) {
                            info!("worker {} pinned to CPU {}", i, core.id);
                        } else {
                            warn!("worker {} failed to pin to CPU {}", i, core.id);
                        }
                    }
                    let result =
                        EventLoop::new(i, listen_fd, &worker_cfg, router, metrics, shutdown.clone())
                            .and_then(|mut event_loop| event_loop.run());
                    if let Err(e) = &result {
                        error!("worker {} failed: {}", i, e);
                        // One dead worker stops the rest.
                        shutdown.store(true, Ordering::Release);
                    }
                    result
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    syscalls::close_fd(listen_fd);
                    listeners.for_each(syscalls::close_fd);
                    self.shutdown.store(true, Ordering::Release);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        let reporter = cfg
            .metrics_interval()
            .and_then(|interval| {
                spawn_reporter(interval, self.metrics.clone(), self.shutdown.clone())
            });

        Ok(RunningServer {
            port,
            shutdown: self.shutdown,
            metrics: self.metrics,
            workers,
            reporter,
        })
    }
}

fn spawn_reporter(
    interval: Duration,
    metrics: Arc<WorkerMetrics>,
    shutdown: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("fugue-metrics".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
                if last.elapsed() < interval {
                    continue;
                }
                last = Instant::now();
                let s = metrics.snapshot();
                info!(
                    "[Metrics] Active Connections: {} | Accepted: {} | Messages: {} | Bytes In: {} | Bytes Out: {}",
                    s.active_conns, s.accepted_conns, s.messages, s.bytes_received, s.bytes_sent
                );
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("metrics reporter not started: {}", e);
            None
        }
    }
}

/// Handle to started workers.
pub struct RunningServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<WorkerMetrics>,
    workers: Vec<JoinHandle<FugueResult<()>>>,
    reporter: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// The port every worker listens on.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Wait for every worker; returns the first error any of them hit.
    pub fn join(self) -> FugueResult<()> {
        let mut result = Ok(());
        for (i, handle) in self.workers.into_iter().enumerate() {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(FugueError::WorkerPanic(format!("worker {i}: {msg}")))
                }
            };
            if let Err(e) = outcome {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        // The reporter only stops on the flag.
        self.shutdown.store(true, Ordering::Release);
        if let Some(reporter) = self.reporter {
            let _ = reporter.join();
        }
        info!("Fugue server shut down.");
        result
    }
}
