use serde::{Deserialize, Serialize};

use crate::types::Quote;

/// User-tunable screening thresholds. All ranges are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConditions {
    /// Market cap bounds in 亿.
    pub market_cap_min: f64,
    pub market_cap_max: f64,
    /// Turnover rate bounds in %.
    pub turnover_min: f64,
    pub turnover_max: f64,
    /// Change percent bounds in %.
    pub change_min: f64,
    pub change_max: f64,
    pub volume_ratio_min: f64,
    /// Drop names carrying an ST marker.
    pub exclude_st: bool,
    /// Minimum above-average ratio (%) for the intraday stage.
    pub strength_min: f64,
}

impl Default for FilterConditions {
    fn default() -> Self {
        Self {
            market_cap_min: 50.0,
            market_cap_max: 200.0,
            turnover_min: 5.0,
            turnover_max: 10.0,
            change_min: 3.0,
            change_max: 5.0,
            volume_ratio_min: 1.2,
            exclude_st: true,
            strength_min: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    St,
    MarketCap,
    VolumeRatio,
    Change,
    Turnover,
}

/// `ST`, `*ST`, `S*ST` and lowercase variants.
pub fn is_st(name: &str) -> bool {
    name.to_uppercase().contains("ST")
}

impl FilterConditions {
    /// ST exclusion is checked first and wins regardless of the other fields.
    pub fn check(&self, q: &Quote) -> Result<(), Rejection> {
        if self.exclude_st && is_st(&q.name) {
            return Err(Rejection::St);
        }
        if q.market_cap < self.market_cap_min || q.market_cap > self.market_cap_max {
            return Err(Rejection::MarketCap);
        }
        if q.volume_ratio < self.volume_ratio_min {
            return Err(Rejection::VolumeRatio);
        }
        if q.change_percent < self.change_min || q.change_percent > self.change_max {
            return Err(Rejection::Change);
        }
        if q.turnover_rate < self.turnover_min || q.turnover_rate > self.turnover_max {
            return Err(Rejection::Turnover);
        }
        Ok(())
    }

    pub fn passes(&self, q: &Quote) -> bool {
        self.check(q).is_ok()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterStats {
    pub scanned: usize,
    pub rejected_st: usize,
    pub rejected_market_cap: usize,
    pub rejected_volume_ratio: usize,
    pub rejected_change: usize,
    pub rejected_turnover: usize,
    pub passed: usize,
}

/// Stage 2: keeps quotes passing `conditions`, strongest change first.
pub fn basic_filter(quotes: &[Quote], conditions: &FilterConditions) -> (Vec<Quote>, FilterStats) {
    let mut stats = FilterStats {
        scanned: quotes.len(),
        ..FilterStats::default()
    };
    let mut candidates = Vec::new();

    for q in quotes {
        match conditions.check(q) {
            Ok(()) => candidates.push(q.clone()),
            Err(rejection) => match rejection {
                Rejection::St => stats.rejected_st += 1,
                Rejection::MarketCap => stats.rejected_market_cap += 1,
                Rejection::VolumeRatio => stats.rejected_volume_ratio += 1,
                Rejection::Change => stats.rejected_change += 1,
                Rejection::Turnover => stats.rejected_turnover += 1,
            },
        }
    }

    candidates.sort_by(|a, b| b.change_percent.total_cmp(&a.change_percent));
    stats.passed = candidates.len();
    (candidates, stats)
}
