//! Per-frame bookkeeping that does not touch the GPU: the phase machine, the
//! dispatch grid, the clock and the FPS counter.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::kernel::WORKGROUP_SIZE;

/// Where a frame is in its lifecycle. Every frame walks the phases in order
/// and returns to `Idle` whether it published or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramePhase {
    #[default]
    Idle,
    BindingsUpdated,
    Dispatched,
    Synced,
    Published,
}

impl FramePhase {
    /// The phase that legally follows this one.
    pub fn next(self) -> FramePhase {
        match self {
            FramePhase::Idle => FramePhase::BindingsUpdated,
            FramePhase::BindingsUpdated => FramePhase::Dispatched,
            FramePhase::Dispatched => FramePhase::Synced,
            FramePhase::Synced => FramePhase::Published,
            FramePhase::Published => FramePhase::Idle,
        }
    }
}

impl fmt::Display for FramePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FramePhase::Idle => "idle",
            FramePhase::BindingsUpdated => "bindings updated",
            FramePhase::Dispatched => "dispatched",
            FramePhase::Synced => "synced",
            FramePhase::Published => "published",
        };
        f.write_str(name)
    }
}

/// How a viewport that is not a multiple of the workgroup size is covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridRounding {
    /// Integer division; the right and bottom remainder strips are never written.
    #[default]
    Truncate,
    /// Round up so every pixel gets an invocation. The kernel must bounds-check.
    Ceil,
}

/// Number of workgroups to launch along each axis.
pub fn dispatch_grid(width: u32, height: u32, rounding: GridRounding) -> [u32; 3] {
    let [local_x, local_y, _] = WORKGROUP_SIZE;
    match rounding {
        GridRounding::Truncate => [width / local_x, height / local_y, 1],
        GridRounding::Ceil => [width.div_ceil(local_x), height.div_ceil(local_y), 1],
    }
}

/// Width of the right strip and height of the bottom strip that a grid leaves
/// without invocations.
pub fn uncovered_strip(width: u32, height: u32, grid: [u32; 3]) -> (u32, u32) {
    let [local_x, local_y, _] = WORKGROUP_SIZE;
    (
        width.saturating_sub(grid[0] * local_x),
        height.saturating_sub(grid[1] * local_y),
    )
}

/// Logs once at setup when part of the image will never be written.
pub(crate) fn warn_if_uncovered(width: u32, height: u32, grid: [u32; 3]) {
    let (right, bottom) = uncovered_strip(width, height, grid);
    if right > 0 || bottom > 0 {
        warn!(
            width,
            height,
            right_columns = right,
            bottom_rows = bottom,
            "viewport is not a multiple of the workgroup size; edge pixels keep their initial value"
        );
    }
}

/// Accumulated shader time. Starts at zero and is never reset.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameClock {
    time: f32,
    frames: u64,
}

impl FrameClock {
    /// Adds `delta` seconds; negative or non-finite deltas count as zero.
    pub fn advance(&mut self, delta: f32) -> f32 {
        if delta.is_finite() && delta > 0.0 {
            self.time += delta;
        }
        self.frames += 1;
        self.time
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Frames-per-second estimate refreshed once a second.
#[derive(Debug, Clone)]
pub struct FrameStats {
    last_update: Instant,
    frames_since_update: u32,
    frames_per_second: f32,
}

impl FrameStats {
    pub fn new(now: Instant) -> Self {
        Self {
            last_update: now,
            frames_since_update: 0,
            frames_per_second: 0.0,
        }
    }

    /// Records one published frame and returns the new estimate when it was
    /// refreshed.
    pub fn record(&mut self, now: Instant) -> Option<f32> {
        self.frames_since_update += 1;
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        self.frames_per_second = self.frames_since_update as f32 / elapsed.as_secs_f32();
        self.frames_since_update = 0;
        self.last_update = now;
        Some(self.frames_per_second)
    }

    pub fn frames_per_second(&self) -> f32 {
        self.frames_per_second
    }
}

pub(crate) fn log_stats(fps: f32, clock: &FrameClock, grid: [u32; 3]) {
    debug!(
        fps = fps.round(),
        frame_count = clock.frames(),
        time = clock.time(),
        grid = ?grid,
        "render stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncating_grid_drops_partial_groups() {
        assert_eq!(dispatch_grid(1920, 1080, GridRounding::Truncate), [240, 135, 1]);
        assert_eq!(dispatch_grid(1000, 1000, GridRounding::Truncate), [125, 125, 1]);
        assert_eq!(dispatch_grid(8, 8, GridRounding::Truncate), [1, 1, 1]);
        assert_eq!(dispatch_grid(7, 7, GridRounding::Truncate), [0, 0, 1]);
        assert_eq!(dispatch_grid(1001, 1003, GridRounding::Truncate), [125, 125, 1]);
    }

    #[test]
    fn ceil_grid_covers_every_pixel() {
        assert_eq!(dispatch_grid(1001, 1003, GridRounding::Ceil), [126, 126, 1]);
        assert_eq!(dispatch_grid(7, 7, GridRounding::Ceil), [1, 1, 1]);
        assert_eq!(dispatch_grid(16, 16, GridRounding::Ceil), [2, 2, 1]);
    }

    #[test]
    fn uncovered_strip_matches_remainder() {
        let grid = dispatch_grid(1001, 1003, GridRounding::Truncate);
        assert_eq!(uncovered_strip(1001, 1003, grid), (1, 3));
        let grid = dispatch_grid(1001, 1003, GridRounding::Ceil);
        assert_eq!(uncovered_strip(1001, 1003, grid), (0, 0));
    }

    #[test]
    fn clock_accumulates_and_ignores_negative_deltas() {
        let mut clock = FrameClock::default();
        assert_eq!(clock.time(), 0.0);
        clock.advance(0.016);
        clock.advance(0.016);
        clock.advance(0.016);
        assert!((clock.time() - 0.048).abs() < 1e-6);

        clock.advance(-1.0);
        clock.advance(f32::NAN);
        assert!((clock.time() - 0.048).abs() < 1e-6);
        assert_eq!(clock.frames(), 5);
    }

    #[test]
    fn zero_delta_keeps_time() {
        let mut clock = FrameClock::default();
        clock.advance(0.5);
        assert_eq!(clock.advance(0.0), 0.5);
    }

    #[test]
    fn phases_cycle_back_to_idle() {
        let mut phase = FramePhase::Idle;
        let mut seen = vec![phase];
        for _ in 0..5 {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                FramePhase::Idle,
                FramePhase::BindingsUpdated,
                FramePhase::Dispatched,
                FramePhase::Synced,
                FramePhase::Published,
                FramePhase::Idle,
            ]
        );
    }

    #[test]
    fn stats_refresh_once_per_second() {
        let start = Instant::now();
        let mut stats = FrameStats::new(start);
        for frame in 1..60 {
            assert_eq!(stats.record(start + Duration::from_millis(frame * 16)), None);
        }
        let fps = stats
            .record(start + Duration::from_secs(1))
            .expect("refreshed");
        assert!((fps - 60.0).abs() < 1e-3);
    }
}
