//! Adaptive search for the highest sustainable offered rate.
//!
//! Loss rates are carried as hundredths of a percent (`loss_x100`) and
//! rates as whole kbit/s, so the search runs on integer math end to end.
//! The search brackets the answer between `min_kbps` and `max_kbps` and
//! stops once a measurement lands inside the loss bracket or the bracket
//! width shrinks below 5%.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AppError, AppResult, RateError};

const FLOOR_KBPS: u64 = 1;
const CEILING_KBPS: u64 = 10_000_000;
const START_KBPS: u64 = 5_000_000;
const MAX_ITERATIONS: u32 = 50;

/// Acceptable loss window, in hundredths of a percent. A measurement whose
/// loss falls inside the window ends the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossBracket {
    pub min_loss_x100: u32,
    pub max_loss_x100: u32,
}

/// One measurement: the rate that was offered, the rate the sender actually
/// achieved, and the observed loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    pub kbps: u64,
    pub measured_kbps: u64,
    pub loss_x100: u32,
}

/// Runs one timed measurement at the offered rate.
#[async_trait]
pub trait RateMeasurer: Send {
    /// # Errors
    ///
    /// A measurement error aborts the whole search; it is propagated as-is
    /// with no partial result.
    async fn measure(&mut self, kbps: u64) -> AppResult<RateSample>;
}

pub struct RateConverger {
    bracket: LossBracket,
    min_kbps: u64,
    max_kbps: u64,
    kbps: u64,
}

impl RateConverger {
    /// # Errors
    ///
    /// Returns `RateError::InvalidBracket` when the loss window is inverted.
    pub fn new(bracket: LossBracket) -> Result<Self, RateError> {
        if bracket.min_loss_x100 > bracket.max_loss_x100 {
            return Err(RateError::InvalidBracket {
                min_loss_x100: bracket.min_loss_x100,
                max_loss_x100: bracket.max_loss_x100,
            });
        }
        Ok(Self {
            bracket,
            min_kbps: FLOOR_KBPS,
            max_kbps: CEILING_KBPS,
            kbps: START_KBPS,
        })
    }

    /// Runs the search and returns the last successful measurement, whether
    /// the loop ended by landing inside the bracket or by the width stop.
    ///
    /// # Errors
    ///
    /// Propagates measurement errors unchanged; `RateError::EmptySearch` if
    /// no measurement completed.
    pub async fn converge<TMeasurer>(&mut self, measurer: &mut TMeasurer) -> AppResult<RateSample>
    where
        TMeasurer: RateMeasurer,
    {
        let mut last: Option<RateSample> = None;
        for iteration in 0..MAX_ITERATIONS {
            if self.is_narrow() {
                debug!("Rate search stopped at iteration {}: bracket within 5%", iteration);
                break;
            }
            let sample = measurer.measure(self.kbps).await?;
            debug!(
                "Rate sample: offered {} kbps, measured {} kbps, loss {}/100 %",
                sample.kbps, sample.measured_kbps, sample.loss_x100
            );
            let converged = self.absorb(&sample);
            last = Some(sample);
            if converged {
                break;
            }
        }
        last.ok_or_else(|| AppError::rate(RateError::EmptySearch))
    }

    /// Next rate the search would offer.
    #[must_use]
    pub fn offered_kbps(&self) -> u64 {
        self.kbps
    }

    #[must_use]
    pub fn bracket_kbps(&self) -> (u64, u64) {
        (self.min_kbps, self.max_kbps)
    }

    fn is_narrow(&self) -> bool {
        self.min_kbps.saturating_mul(100) >= self.max_kbps.saturating_mul(95)
    }

    /// Folds one measurement into the search state; returns true when the
    /// measurement's loss landed inside the bracket.
    fn absorb(&mut self, sample: &RateSample) -> bool {
        // Sender could not keep up regardless of loss: the offered rate is
        // fiction above what was measured, so shrink toward the measured
        // rate and cap the bracket there.
        if sample.measured_kbps.saturating_mul(100) < self.kbps.saturating_mul(80) {
            let half_gap = self.kbps.saturating_sub(sample.measured_kbps) / 2;
            let shrunk = sample
                .measured_kbps
                .saturating_add(half_gap)
                .min(sample.measured_kbps.saturating_mul(3));
            self.kbps = shrunk.max(self.min_kbps).max(FLOOR_KBPS);
            self.max_kbps = self.kbps;
            return false;
        }
        if sample.loss_x100 < self.bracket.min_loss_x100 {
            // Room to push harder.
            self.min_kbps = if sample.measured_kbps > self.min_kbps {
                sample.measured_kbps.min(self.max_kbps)
            } else {
                self.midpoint()
            };
            self.kbps = self.midpoint();
            return false;
        }
        if sample.loss_x100 > self.bracket.max_loss_x100 {
            // Too aggressive.
            self.max_kbps = self.kbps.min(sample.measured_kbps).max(self.min_kbps);
            self.kbps = self.midpoint();
            return false;
        }
        true
    }

    fn midpoint(&self) -> u64 {
        self.min_kbps
            .saturating_add(self.max_kbps.saturating_sub(self.min_kbps) / 2)
    }
}
