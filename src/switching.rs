//! Profit switching: pick an algorithm for every device from a revenue table.

use crate::devices::Device;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;

/// device -> algorithm name -> revenue (BTC/day)
pub type RevenueTable = BTreeMap<Device, BTreeMap<String, f64>>;

/// device -> algorithm name
pub type Assignment = BTreeMap<Device, String>;

pub trait ProfitSwitcher: Send + Sync {
    /// Forget any previous decision.
    fn reset(&mut self);

    /// Decide an algorithm for each device in `revenues`.
    ///
    /// Devices with no candidate algorithms are left out of the result.
    fn decide(&mut self, revenues: &RevenueTable, timestamp: DateTime<Local>) -> Assignment;
}

/// Switches to the best algorithm only when it beats the current one by a
/// multiplicative `threshold` margin.
#[derive(Debug, Clone)]
pub struct NaiveSwitcher {
    threshold: f64,
    last_decision: Assignment,
}

impl NaiveSwitcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last_decision: Assignment::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    pub fn last_decision(&self) -> &Assignment {
        &self.last_decision
    }
}

/// Highest-revenue algorithm. Ties go to the lexicographically smallest name.
pub fn best_algorithm(revenues: &BTreeMap<String, f64>) -> Option<(&str, f64)> {
    revenues
        .iter()
        .fold(None, |best: Option<(&str, f64)>, (name, &revenue)| match best {
            Some((_, best_revenue)) if best_revenue >= revenue => best,
            _ => Some((name.as_str(), revenue)),
        })
}

impl ProfitSwitcher for NaiveSwitcher {
    fn reset(&mut self) {
        self.last_decision.clear();
    }

    fn decide(&mut self, revenues: &RevenueTable, timestamp: DateTime<Local>) -> Assignment {
        let mut decision = Assignment::new();
        for (device, device_revenues) in revenues {
            let Some((switch_algo, switch_revenue)) = best_algorithm(device_revenues) else {
                continue;
            };

            let chosen = match self.last_decision.get(device) {
                None => {
                    tracing::info!(
                        "Assigning {} to {} ({:.3} mBTC/day)",
                        device,
                        switch_algo,
                        switch_revenue * 1e3
                    );
                    switch_algo.to_string()
                }
                Some(stay_algo) if stay_algo == switch_algo => stay_algo.clone(),
                Some(stay_algo) => {
                    let stay_revenue = device_revenues.get(stay_algo).copied().unwrap_or(0.0);
                    let min_factor = 1.0 + self.threshold;
                    if stay_revenue == 0.0 || switch_revenue / stay_revenue >= min_factor {
                        tracing::info!(
                            "Switching {} from {} to {} ({:.3} -> {:.3} mBTC/day)",
                            device,
                            stay_algo,
                            switch_algo,
                            stay_revenue * 1e3,
                            switch_revenue * 1e3
                        );
                        switch_algo.to_string()
                    } else {
                        tracing::debug!(
                            "Keeping {} on {} ({} only {:.2}x better)",
                            device,
                            stay_algo,
                            switch_algo,
                            switch_revenue / stay_revenue
                        );
                        stay_algo.clone()
                    }
                }
            };
            decision.insert(device.clone(), chosen);
        }
        tracing::trace!("Decision at {}: {:?}", timestamp, decision);
        self.last_decision = decision.clone();
        decision
    }
}
