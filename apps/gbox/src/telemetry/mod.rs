//! Per-session traffic accounting. Counting is switched on with `GBOX_PERF`;
//! otherwise every call here is a single branch.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub mod logging;

static REPORTING: Lazy<bool> = Lazy::new(|| {
    std::env::var("GBOX_PERF").is_ok_and(|value| !value.is_empty() && value != "0")
});

static TRAFFIC: Counters = Counters::new();

/// Where a chunk of session bytes travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    StdinToRemote,
    RemoteToStdout,
    RemoteToStderr,
}

impl Flow {
    const COUNT: usize = 3;

    fn slot(self) -> usize {
        match self {
            Flow::StdinToRemote => 0,
            Flow::RemoteToStdout => 1,
            Flow::RemoteToStderr => 2,
        }
    }
}

struct Counters {
    bytes: [AtomicU64; Flow::COUNT],
    chunks: [AtomicU64; Flow::COUNT],
}

impl Counters {
    const fn new() -> Self {
        Self {
            bytes: [const { AtomicU64::new(0) }; Flow::COUNT],
            chunks: [const { AtomicU64::new(0) }; Flow::COUNT],
        }
    }

    fn add(&self, flow: Flow, bytes: usize) {
        self.bytes[flow.slot()].fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks[flow.slot()].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Traffic {
        let load = |cells: &[AtomicU64; Flow::COUNT]| {
            [0, 1, 2].map(|slot| cells[slot].load(Ordering::Relaxed))
        };
        Traffic {
            bytes: load(&self.bytes),
            chunks: load(&self.chunks),
        }
    }
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    bytes: [u64; Flow::COUNT],
    chunks: [u64; Flow::COUNT],
}

impl Traffic {
    pub fn bytes(&self, flow: Flow) -> u64 {
        self.bytes[flow.slot()]
    }

    pub fn chunks(&self, flow: Flow) -> u64 {
        self.chunks[flow.slot()]
    }

    fn since(&self, earlier: &Traffic) -> Traffic {
        let diff = |now: [u64; Flow::COUNT], then: [u64; Flow::COUNT]| {
            [0, 1, 2].map(|slot| now[slot].saturating_sub(then[slot]))
        };
        Traffic {
            bytes: diff(self.bytes, earlier.bytes),
            chunks: diff(self.chunks, earlier.chunks),
        }
    }
}

pub fn reporting() -> bool {
    *REPORTING
}

pub fn record(flow: Flow, bytes: usize) {
    if reporting() {
        TRAFFIC.add(flow, bytes);
    }
}

/// Prints how long one exec ran and what it moved, when dropped.
pub struct SessionReport {
    box_id: String,
    started: Instant,
    baseline: Traffic,
}

impl SessionReport {
    pub fn start(box_id: &str) -> Option<Self> {
        reporting().then(|| Self {
            box_id: box_id.to_owned(),
            started: Instant::now(),
            baseline: TRAFFIC.snapshot(),
        })
    }
}

impl Drop for SessionReport {
    fn drop(&mut self) {
        let moved = TRAFFIC.snapshot().since(&self.baseline);
        eprintln!("{}", summary(&self.box_id, self.started.elapsed(), &moved));
    }
}

fn summary(box_id: &str, elapsed: Duration, moved: &Traffic) -> String {
    format!(
        "[perf] exec {box_id}: {:.1}ms stdin={}B/{} stdout={}B/{} stderr={}B/{}",
        elapsed.as_secs_f64() * 1000.0,
        moved.bytes(Flow::StdinToRemote),
        moved.chunks(Flow::StdinToRemote),
        moved.bytes(Flow::RemoteToStdout),
        moved.chunks(Flow::RemoteToStdout),
        moved.bytes(Flow::RemoteToStderr),
        moved.chunks(Flow::RemoteToStderr),
    )
}
