// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::VecDeque, time::Duration};

/// Weight of a new sample in the moving average.
const SMOOTHING: f64 = 0.2;
/// Samples kept for the windowed minimum.
const WINDOW: usize = 10;

/// Per-server round-trip-time statistics: an exponentially-weighted moving
/// average and a bounded-window minimum.
///
/// The minimum reports zero until two samples exist, so a single slow
/// bootstrap measurement cannot poison timeout math.
#[derive(Debug, Default)]
pub struct RttSampler {
    average: Option<Duration>,
    window: VecDeque<Duration>,
}

impl RttSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: Duration) {
        self.average = Some(match self.average {
            None => sample,
            Some(current) => {
                let blended = current.as_secs_f64() * (1.0 - SMOOTHING)
                    + sample.as_secs_f64() * SMOOTHING;
                Duration::from_secs_f64(blended)
            },
        });

        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    pub fn average(&self) -> Option<Duration> {
        self.average
    }

    pub fn min(&self) -> Duration {
        if self.window.len() < 2 {
            return Duration::ZERO;
        }
        self.window.iter().min().copied().unwrap_or(Duration::ZERO)
    }

    pub fn reset(&mut self) {
        self.average = None;
        self.window.clear();
    }
}
