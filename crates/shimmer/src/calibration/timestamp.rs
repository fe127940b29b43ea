//! Reconstruction of a monotonic device clock from the 16-bit tick counter
//! carried in every frame, with packet-loss estimation.

use log::trace;

const CYCLE_TICKS: f64 = 65536.0;

/// Calibrated timestamp of one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampSample {
    pub milliseconds: f64,
    pub packet_loss_count: u64,
    pub reception_rate: f64,
}

#[derive(Debug, Clone)]
pub struct TimestampCalibrator {
    tick_hz: f64,
    sampling_rate_hz: f64,
    cycles: u64,
    last_extended: Option<f64>,
    first_ms: Option<f64>,
    last_ms: Option<f64>,
    lost: u64,
    reception_rate: f64,
}

impl TimestampCalibrator {
    pub fn new(tick_hz: f64, sampling_rate_hz: f64) -> Self {
        Self {
            tick_hz,
            sampling_rate_hz,
            cycles: 0,
            last_extended: None,
            first_ms: None,
            last_ms: None,
            lost: 0,
            reception_rate: 100.0,
        }
    }

    /// Forget all history; called whenever streaming starts.
    pub fn reset(&mut self) {
        *self = Self::new(self.tick_hz, self.sampling_rate_hz);
    }

    pub fn set_sampling_rate(&mut self, hz: f64) {
        self.sampling_rate_hz = hz;
    }

    pub fn set_tick_frequency(&mut self, hz: f64) {
        self.tick_hz = hz;
    }

    pub fn packets_lost(&self) -> u64 {
        self.lost
    }

    pub fn calibrate(&mut self, raw: u16) -> TimestampSample {
        let raw = raw as f64;
        if let Some(last) = self.last_extended {
            if last > raw + CYCLE_TICKS * self.cycles as f64 {
                self.cycles += 1;
            }
        }
        let extended = raw + CYCLE_TICKS * self.cycles as f64;
        self.last_extended = Some(extended);
        let ms = extended / self.tick_hz * 1000.0;

        let first = *self.first_ms.get_or_insert(ms);
        if let Some(previous) = self.last_ms {
            let delta = ms - previous;
            if self.sampling_rate_hz > 1.0 && delta > 1000.0 / (self.sampling_rate_hz - 1.0) {
                self.lost += 1;
                trace!("Gap of {:.2} ms detected, {} packets lost so far", delta, self.lost);
            }
        }
        self.last_ms = Some(ms);

        if self.sampling_rate_hz > 0.0 {
            let expected = (ms - first) / (1000.0 / self.sampling_rate_hz);
            if expected > 0.0 {
                self.reception_rate =
                    ((expected - self.lost as f64) / expected * 100.0).clamp(0.0, 100.0);
            }
        }

        TimestampSample {
            milliseconds: ms,
            packet_loss_count: self.lost,
            reception_rate: self.reception_rate,
        }
    }
}
