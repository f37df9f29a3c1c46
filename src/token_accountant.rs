//! Token Accountant (§4.E): a thread-safe sidecar that estimates prompt/
//! response token usage purely from text length — no external tokenizer
//! or extra API call — and aggregates savings from the compact prompt
//! variant. Grounded on `token_tracker.py::TokenTracker` in
//! `original_source/`, which this module follows field-for-field
//! (`TOKEN_COSTS`, `TOON_REDUCTION_FACTOR` -> `COMPACT_REDUCTION_RATIO`,
//! the `% 10` persistence cadence, the 1000-record ring buffer).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

const RING_CAPACITY: usize = 1000;
const COMPACT_REDUCTION_RATIO: f64 = 0.571;
const PERSIST_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    StoryExtraction,
    TestCaseExtraction,
}

impl CallType {
    fn as_str(&self) -> &'static str {
        match self {
            CallType::StoryExtraction => "story_extraction",
            CallType::TestCaseExtraction => "test_case_extraction",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub timestamp: DateTime<Utc>,
    pub call_type: CallType,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub compact_prompt_used: bool,
    pub estimated_standard_tokens: u64,
    pub tokens_saved: u64,
    pub reduction_percentage: f64,
    pub model: String,
    pub provider: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub attribution_id: Option<String>,
    pub attribution_title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub total_tokens_saved: u64,
    pub calls_with_compact_prompt: u64,
    pub calls_without_compact_prompt: u64,
    pub estimated_cost_usd: f64,
    pub estimated_savings_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTypeAverage {
    pub call_type: String,
    pub calls: u64,
    pub average_total_tokens: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub calls: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub stats: TokenStats,
    pub per_call_type: Vec<CallTypeAverage>,
    pub last_24h_hourly: Vec<HourlyBucket>,
    pub estimated_savings_usd: f64,
}

fn cost_per_1k(model: &str) -> (f64, f64) {
    match model {
        "gpt-4" => (0.03, 0.06),
        "gpt-4-turbo" => (0.01, 0.03),
        "gpt-4o" => (0.005, 0.015),
        "gpt-4o-mini" => (0.00015, 0.0006),
        "gpt-3.5-turbo" => (0.0005, 0.0015),
        _ => (0.03, 0.06), // unknown models fall back to gpt-4 pricing
    }
}

/// `est(text) = max(1, len(text) / d)`, `d = 3` for JSON-like content
/// (contains `{` or `[`), `d = 4` otherwise.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let divisor = if text.contains('{') || text.contains('[') {
        3
    } else {
        4
    };
    (text.len() as u64 / divisor).max(1)
}

struct Inner {
    records: VecDeque<TokenRecord>,
    stats: TokenStats,
    per_call_type_totals: HashMap<CallType, (u64, u64)>, // (calls, total_tokens)
}

/// Thread-safe singleton wiring point: one owned `TokenAccountant`
/// behind a mutex, shared by `Arc` into workers at construction — per
/// the teacher's design-note pattern for the thread-safe singleton
/// (§9), avoiding process-global mutable state.
pub struct TokenAccountant {
    inner: Mutex<Inner>,
    persist_path: Option<PathBuf>,
}

impl TokenAccountant {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let loaded = persist_path.as_ref().and_then(|p| Self::load_from_disk(p));
        let (records, stats) = loaded.unwrap_or_default();

        let mut per_call_type_totals = HashMap::new();
        for r in &records {
            let entry = per_call_type_totals.entry(r.call_type).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += r.total_tokens;
        }

        TokenAccountant {
            inner: Mutex::new(Inner {
                records,
                stats,
                per_call_type_totals,
            }),
            persist_path,
        }
    }

    fn load_from_disk(path: &PathBuf) -> Option<(VecDeque<TokenRecord>, TokenStats)> {
        let content = std::fs::read_to_string(path).ok()?;
        let file: PersistedFile = serde_json::from_str(&content).ok()?;
        Some((file.records.into(), file.stats))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        call_type: CallType,
        prompt_text: &str,
        response_text: &str,
        compact_prompt_used: bool,
        model: &str,
        provider: &str,
        success: bool,
        error_message: Option<String>,
        attribution_id: Option<String>,
        attribution_title: Option<String>,
        now: DateTime<Utc>,
    ) -> TokenRecord {
        let prompt_tokens = estimate_tokens(prompt_text);
        let completion_tokens = estimate_tokens(response_text);
        let total_tokens = prompt_tokens + completion_tokens;

        let (estimated_standard_tokens, tokens_saved, reduction_percentage) = if compact_prompt_used
        {
            let estimated_standard = (prompt_tokens as f64 / (1.0 - COMPACT_REDUCTION_RATIO)) as u64;
            let saved = estimated_standard.saturating_sub(prompt_tokens);
            (estimated_standard, saved, COMPACT_REDUCTION_RATIO * 100.0)
        } else {
            (prompt_tokens, 0, 0.0)
        };

        let (input_cost, output_cost) = cost_per_1k(model);
        let call_cost =
            (prompt_tokens as f64 / 1000.0) * input_cost + (completion_tokens as f64 / 1000.0) * output_cost;

        let record = TokenRecord {
            timestamp: now,
            call_type,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            compact_prompt_used,
            estimated_standard_tokens,
            tokens_saved,
            reduction_percentage,
            model: model.to_string(),
            provider: provider.to_string(),
            success,
            error_message,
            attribution_id,
            attribution_title,
        };

        let mut inner = self.inner.lock().expect("token accountant mutex poisoned");

        if inner.records.len() == RING_CAPACITY {
            inner.records.pop_front();
        }
        inner.records.push_back(record.clone());

        inner.stats.total_calls += 1;
        if success {
            inner.stats.successful_calls += 1;
        } else {
            inner.stats.failed_calls += 1;
        }
        inner.stats.total_prompt_tokens += prompt_tokens;
        inner.stats.total_completion_tokens += completion_tokens;
        inner.stats.total_tokens += total_tokens;
        inner.stats.total_tokens_saved += tokens_saved;
        if compact_prompt_used {
            inner.stats.calls_with_compact_prompt += 1;
        } else {
            inner.stats.calls_without_compact_prompt += 1;
        }
        inner.stats.estimated_cost_usd += call_cost;
        let savings_tokens_cost = (tokens_saved as f64 / 1000.0) * input_cost;
        inner.stats.estimated_savings_usd += savings_tokens_cost;

        let entry = inner.per_call_type_totals.entry(call_type).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += total_tokens;

        let should_persist = inner.stats.total_calls as usize % PERSIST_EVERY == 0;
        if should_persist {
            self.persist_locked(&inner);
        }

        record
    }

    pub fn stats(&self) -> TokenStats {
        self.inner.lock().expect("token accountant mutex poisoned").stats.clone()
    }

    pub fn dashboard(&self) -> Dashboard {
        let inner = self.inner.lock().expect("token accountant mutex poisoned");

        let per_call_type = inner
            .per_call_type_totals
            .iter()
            .map(|(call_type, (calls, total_tokens))| CallTypeAverage {
                call_type: call_type.as_str().to_string(),
                calls: *calls,
                average_total_tokens: if *calls > 0 {
                    *total_tokens as f64 / *calls as f64
                } else {
                    0.0
                },
            })
            .collect();

        let mut hourly: HashMap<DateTime<Utc>, (u64, u64)> = HashMap::new();
        for record in &inner.records {
            let truncated = record
                .timestamp
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(record.timestamp);
            let entry = hourly.entry(truncated).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += record.total_tokens;
        }
        let mut last_24h_hourly: Vec<HourlyBucket> = hourly
            .into_iter()
            .map(|(hour, (calls, total_tokens))| HourlyBucket {
                hour,
                calls,
                total_tokens,
            })
            .collect();
        last_24h_hourly.sort_by_key(|b| b.hour);

        Dashboard {
            stats: inner.stats.clone(),
            per_call_type,
            last_24h_hourly,
            estimated_savings_usd: inner.stats.estimated_savings_usd,
        }
    }

    /// Force a persist regardless of the `% 10` cadence (e.g. on graceful
    /// shutdown, per §5's cancellation sequence, or `POST tokens/clear`).
    pub fn flush(&self) {
        let inner = self.inner.lock().expect("token accountant mutex poisoned");
        self.persist_locked(&inner);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("token accountant mutex poisoned");
        inner.records.clear();
        inner.stats = TokenStats::default();
        inner.per_call_type_totals.clear();
        self.persist_locked(&inner);
    }

    fn persist_locked(&self, inner: &Inner) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let file = PersistedFile {
            records: inner.records.iter().cloned().collect(),
            stats: inner.stats.clone(),
            last_updated: Utc::now(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&file) {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(path, json);
        }
    }
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            records: VecDeque::new(),
            stats: TokenStats::default(),
            per_call_type_totals: HashMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFile {
    records: Vec<TokenRecord>,
    stats: TokenStats,
    last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_uses_json_divisor_for_braces() {
        let json_text = "x".repeat(90);
        let json_text = format!("{{{json_text}}}");
        assert_eq!(estimate_tokens(&json_text), (json_text.len() as u64) / 3);
    }

    #[test]
    fn estimate_uses_plain_divisor_otherwise() {
        let text = "a".repeat(100);
        assert_eq!(estimate_tokens(&text), 25);
    }

    #[test]
    fn estimate_floors_at_one_for_nonempty() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn s7_non_compact_call_matches_scenario() {
        let accountant = TokenAccountant::new(None);
        let prompt = "x".repeat(400);
        let response = "y".repeat(120);
        let record = accountant.record(
            CallType::StoryExtraction,
            &prompt,
            &response,
            false,
            "gpt-4o-mini",
            "OPENAI",
            true,
            None,
            None,
            None,
            Utc::now(),
        );
        assert_eq!(record.prompt_tokens, 100);
        assert_eq!(record.completion_tokens, 30);
        assert_eq!(record.total_tokens, 130);
        assert_eq!(record.tokens_saved, 0);

        let stats = accountant.stats();
        let expected_cost = 100.0 / 1000.0 * 0.00015 + 30.0 / 1000.0 * 0.0006;
        assert!((stats.estimated_cost_usd - expected_cost).abs() < 1e-9);
    }

    #[test]
    fn compact_prompt_estimates_savings() {
        let accountant = TokenAccountant::new(None);
        let prompt = "x".repeat(400);
        let record = accountant.record(
            CallType::StoryExtraction,
            &prompt,
            "short",
            true,
            "gpt-4o",
            "OPENAI",
            true,
            None,
            None,
            None,
            Utc::now(),
        );
        assert!(record.tokens_saved > 0);
        assert!((record.reduction_percentage - 57.1).abs() < 1e-6);
    }

    #[test]
    fn invariant_total_calls_and_tokens_match_records() {
        let accountant = TokenAccountant::new(None);
        for i in 0..25u32 {
            accountant.record(
                if i % 2 == 0 {
                    CallType::StoryExtraction
                } else {
                    CallType::TestCaseExtraction
                },
                "some prompt text here",
                "some response text here",
                i % 3 == 0,
                "gpt-4o-mini",
                "OPENAI",
                true,
                None,
                None,
                None,
                Utc::now(),
            );
        }
        let stats = accountant.stats();
        assert_eq!(stats.total_calls, 25);

        let sum: u64 = {
            let inner = accountant.inner.lock().unwrap();
            inner.records.iter().map(|r| r.prompt_tokens + r.completion_tokens).sum()
        };
        assert_eq!(stats.total_tokens, sum);
    }

    #[test]
    fn ring_buffer_caps_at_1000() {
        let accountant = TokenAccountant::new(None);
        for _ in 0..1100 {
            accountant.record(
                CallType::StoryExtraction,
                "p",
                "r",
                false,
                "gpt-4o-mini",
                "OPENAI",
                true,
                None,
                None,
                None,
                Utc::now(),
            );
        }
        let inner = accountant.inner.lock().unwrap();
        assert_eq!(inner.records.len(), RING_CAPACITY);
        assert_eq!(inner.stats.total_calls, 1100);
    }

    #[test]
    fn clear_resets_stats_and_records() {
        let accountant = TokenAccountant::new(None);
        accountant.record(
            CallType::StoryExtraction,
            "p",
            "r",
            false,
            "gpt-4o-mini",
            "OPENAI",
            true,
            None,
            None,
            None,
            Utc::now(),
        );
        accountant.clear();
        assert_eq!(accountant.stats().total_calls, 0);
    }
}
