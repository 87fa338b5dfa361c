// src/probe.rs
//! Background sampler of `/proc/stat` and `/proc/meminfo`.
//!
//! One thread appends a [`Sample`] to a bounded history every interval;
//! request handlers only ever read a snapshot of it.
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Sum of all jiffies on the aggregate `cpu` line.
    pub cpu_total: u64,
    pub cpu_idle: u64,
    /// kB, as reported by the kernel.
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_avail: u64,
}

/// Change between two consecutive samples, as served to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeDelta {
    pub timestamp: u64,
    /// Busy fraction of CPU time over the interval, 0.0 to 1.0.
    pub cpu: f64,
    pub memtotal: u64,
    pub memfree: u64,
    pub memavail: u64,
}

/// `(total, idle)` jiffies from the aggregate `cpu` line; idle is the
/// fourth field.
pub fn parse_proc_stat(stat: &str) -> Option<(u64, u64)> {
    let line = stat
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))?;
    let mut total = 0u64;
    let mut idle = 0u64;
    for (i, field) in line.split_whitespace().skip(1).enumerate() {
        let n: u64 = field.parse().ok()?;
        total += n;
        if i == 3 {
            idle = n;
        }
    }
    Some((total, idle))
}

/// `(MemTotal, MemFree, MemAvailable)`; missing fields read as zero.
pub fn parse_meminfo(meminfo: &str) -> (u64, u64, u64) {
    let mut values = (0, 0, 0);
    for line in meminfo.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => values.0 = value,
            "MemFree:" => values.1 = value,
            "MemAvailable:" => values.2 = value,
            _ => {}
        }
    }
    values
}

impl Sample {
    pub fn read() -> io::Result<Self> {
        let stat = fs::read_to_string("/proc/stat")?;
        let meminfo = fs::read_to_string("/proc/meminfo")?;
        let (cpu_total, cpu_idle) = parse_proc_stat(&stat).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "no aggregate cpu line in /proc/stat")
        })?;
        let (mem_total, mem_free, mem_avail) = parse_meminfo(&meminfo);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Self {
            timestamp,
            cpu_total,
            cpu_idle,
            mem_total,
            mem_free,
            mem_avail,
        })
    }
}

/// Bounded, read-mostly ring of samples.
pub struct ProbeHistory {
    samples: RwLock<VecDeque<Sample>>,
    capacity: usize,
}

impl ProbeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, sample: Sample) {
        let mut samples = self.samples.write();
        samples.push_back(sample);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.read().back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// One delta per consecutive pair of samples, oldest first.
    pub fn deltas(&self) -> Vec<ProbeDelta> {
        let samples = self.samples.read();
        samples
            .iter()
            .zip(samples.iter().skip(1))
            .map(|(prev, cur)| delta(prev, cur))
            .collect()
    }
}

fn delta(prev: &Sample, cur: &Sample) -> ProbeDelta {
    let total = cur.cpu_total.saturating_sub(prev.cpu_total);
    let idle = cur.cpu_idle.saturating_sub(prev.cpu_idle);
    let cpu = if total == 0 {
        0.0
    } else {
        1.0 - idle as f64 / total as f64
    };
    ProbeDelta {
        timestamp: cur.timestamp,
        cpu,
        memtotal: cur.mem_total,
        memfree: cur.mem_free,
        memavail: cur.mem_avail,
    }
}

/// Sample now and then every `interval` until `shutdown` is set.
pub fn spawn_sampler(
    history: Arc<ProbeHistory>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("fugue-probe".to_string())
        .spawn(move || {
            let mut next = Instant::now();
            while !shutdown.load(Ordering::Acquire) {
                if Instant::now() >= next {
                    match Sample::read() {
                        Ok(sample) => {
                            debug!("probe sample {:?}", sample);
                            history.push(sample);
                        }
                        Err(e) => error!("probe read failed: {}", e),
                    }
                    next = Instant::now() + interval;
                }
                thread::sleep(Duration::from_millis(200));
            }
        })
}
