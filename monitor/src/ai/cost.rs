//! Rolling-window budget gate for paid analysis calls
//!
//! The window is fixed-length and wall-clock based: it resets in one step once
//! `now >= window_end`, it does not slide.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AiConfig;

/// USD per 1K tokens for models missing from the table
pub const DEFAULT_PRICE_PER_1K: f64 = 0.00025;

/// Built-in USD per 1K tokens, matched by model-name prefix
const PRICING_PER_1K: &[(&str, f64)] = &[
    ("claude-3-5-sonnet", 0.003),
    ("claude-3-haiku", 0.00025),
    ("claude-3-sonnet", 0.003),
    ("claude-3-opus", 0.015),
    ("gpt-3.5-turbo", 0.0005),
    ("gpt-4", 0.03),
    ("gemini-pro", 0.00025),
];

#[derive(Debug, Clone)]
pub struct CostSettings {
    pub max_cost_per_window: f64,
    pub max_calls_per_window: u32,
    pub window: Duration,
    pub alert_fraction: f64,
    pub pricing: HashMap<String, f64>,
}

impl From<&AiConfig> for CostSettings {
    fn from(config: &AiConfig) -> Self {
        Self {
            max_cost_per_window: config.budget.max_cost_per_hour,
            max_calls_per_window: config.triggers.max_ai_calls_per_hour,
            window: Duration::minutes(config.budget.window_minutes as i64),
            alert_fraction: config.budget.alert_on_threshold,
            pricing: config.pricing_per_1k_tokens.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostStats {
    pub window_calls: u32,
    pub window_spent: f64,
    pub window_end: Option<DateTime<Utc>>,
    pub lifetime_calls: u64,
    pub lifetime_tokens: u64,
    pub lifetime_cost: f64,
    pub max_calls: u32,
    pub max_cost: f64,
}

#[derive(Debug)]
struct Window {
    seq: u64,
    end: DateTime<Utc>,
    calls: u32,
    spent: f64,
    alerted: bool,
    lifetime_calls: u64,
    lifetime_tokens: u64,
    lifetime_cost: f64,
}

#[derive(Debug)]
pub struct CostTracker {
    settings: CostSettings,
    window: Mutex<Window>,
}

/// A reserved call slot.
///
/// Holding a permit means the call was already counted against the window.
/// `commit` adds the cost; dropping an uncommitted permit gives the slot back.
#[must_use = "dropping a permit releases the reserved call"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    tracker: &'a CostTracker,
    seq: u64,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    /// Record the completed call and return its cost in USD
    pub fn commit(mut self, tokens: u64, model: &str) -> f64 {
        self.settled = true;
        self.tracker.settle(self.seq, tokens, model)
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.release(self.seq);
        }
    }
}

impl CostTracker {
    pub fn new(settings: CostSettings) -> Self {
        Self::new_at(settings, Utc::now())
    }

    pub fn new_at(settings: CostSettings, now: DateTime<Utc>) -> Self {
        let end = now + settings.window;
        Self {
            settings,
            window: Mutex::new(Window {
                seq: 0,
                end,
                calls: 0,
                spent: 0.0,
                alerted: false,
                lifetime_calls: 0,
                lifetime_tokens: 0,
                lifetime_cost: 0.0,
            }),
        }
    }

    pub fn settings(&self) -> &CostSettings {
        &self.settings
    }

    /// USD per 1K tokens for `model`
    pub fn price_per_1k(&self, model: &str) -> f64 {
        if let Some(price) = self.settings.pricing.get(model) {
            return *price;
        }
        PRICING_PER_1K
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(_, price)| *price)
            .unwrap_or(DEFAULT_PRICE_PER_1K)
    }

    pub fn cost_of(&self, tokens: u64, model: &str) -> f64 {
        tokens as f64 / 1000.0 * self.price_per_1k(model)
    }

    pub fn can_make_call(&self) -> bool {
        self.can_make_call_at(Utc::now())
    }

    pub fn can_make_call_at(&self, now: DateTime<Utc>) -> bool {
        let mut window = self.lock();
        self.reset_if_due(&mut window, now);
        self.has_room(&window)
    }

    /// Atomically check the budget and reserve one call
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        self.try_acquire_at(Utc::now())
    }

    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> Option<CallPermit<'_>> {
        let mut window = self.lock();
        self.reset_if_due(&mut window, now);
        if !self.has_room(&window) {
            debug!(
                calls = window.calls,
                spent = window.spent,
                "Analysis budget exhausted for current window"
            );
            return None;
        }
        window.calls += 1;
        Some(CallPermit {
            tracker: self,
            seq: window.seq,
            settled: false,
        })
    }

    /// Count one completed call outside the permit flow
    pub fn record_call(&self, tokens: u64, model: &str) -> f64 {
        self.record_call_at(tokens, model, Utc::now())
    }

    pub fn record_call_at(&self, tokens: u64, model: &str, now: DateTime<Utc>) -> f64 {
        let seq = {
            let mut window = self.lock();
            self.reset_if_due(&mut window, now);
            window.calls += 1;
            window.seq
        };
        self.settle(seq, tokens, model)
    }

    /// Zero the window if its boundary has passed; returns whether it did
    pub fn check_reset(&self) -> bool {
        self.check_reset_at(Utc::now())
    }

    pub fn check_reset_at(&self, now: DateTime<Utc>) -> bool {
        let mut window = self.lock();
        self.reset_if_due(&mut window, now)
    }

    pub fn stats(&self) -> CostStats {
        let window = self.lock();
        CostStats {
            window_calls: window.calls,
            window_spent: window.spent,
            window_end: Some(window.end),
            lifetime_calls: window.lifetime_calls,
            lifetime_tokens: window.lifetime_tokens,
            lifetime_cost: window.lifetime_cost,
            max_calls: self.settings.max_calls_per_window,
            max_cost: self.settings.max_cost_per_window,
        }
    }

    fn has_room(&self, window: &Window) -> bool {
        window.calls < self.settings.max_calls_per_window
            && window.spent < self.settings.max_cost_per_window
    }

    fn reset_if_due(&self, window: &mut Window, now: DateTime<Utc>) -> bool {
        if now < window.end {
            return false;
        }
        info!(
            calls = window.calls,
            spent = format!("{:.6}", window.spent),
            "Analysis cost window closed"
        );
        window.seq += 1;
        window.calls = 0;
        window.spent = 0.0;
        window.alerted = false;
        window.end = now + self.settings.window;
        true
    }

    fn settle(&self, seq: u64, tokens: u64, model: &str) -> f64 {
        let cost = self.cost_of(tokens, model);
        let mut window = self.lock();
        if window.seq != seq {
            // reserved in a window that has since closed
            window.calls += 1;
        }
        window.spent += cost;
        window.lifetime_calls += 1;
        window.lifetime_tokens += tokens;
        window.lifetime_cost += cost;

        let alert_at = self.settings.max_cost_per_window * self.settings.alert_fraction;
        if !window.alerted && window.spent >= alert_at {
            window.alerted = true;
            warn!(
                spent = format!("{:.6}", window.spent),
                budget = self.settings.max_cost_per_window,
                "Analysis spend crossed alert threshold"
            );
        }
        cost
    }

    fn release(&self, seq: u64) {
        let mut window = self.lock();
        if window.seq == seq {
            window.calls = window.calls.saturating_sub(1);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}
