//! Conversation-history budgeter used when the driver wants explicit
//! bounded history rather than full-transcript accumulation.

use crate::types::Exchange;

const INITIAL_PREVIEW_LIMIT: usize = 2000;
const MIN_PREVIEW_LIMIT: usize = 500;

pub struct ConversationHistory {
    exchanges: Vec<Exchange>,
    summaries: Vec<String>,
    recent_count: usize,
    max_history_tokens: usize,
    preview_limit: usize,
    preview_shrinks: usize,
}

impl ConversationHistory {
    pub fn new(recent_count: usize, max_history_tokens: usize) -> Self {
        Self {
            exchanges: Vec::new(),
            summaries: Vec::new(),
            recent_count,
            max_history_tokens,
            preview_limit: INITIAL_PREVIEW_LIMIT,
            preview_shrinks: 0,
        }
    }

    pub fn push(&mut self, exchange: Exchange) {
        self.exchanges.push(exchange);
    }

    pub fn push_summary(&mut self, summary: String) {
        self.summaries.push(summary);
    }

    /// Formats history for the next prompt, degrading under token pressure:
    /// halve preview limits (max twice), then shrink `recentCount` by 1,
    /// then drop summaries, then hard character truncate. Each step is
    /// re-tried in order until the budget fits or all degradations are
    /// exhausted.
    pub fn format_for_prompt(&mut self) -> String {
        loop {
            let candidate = self.render(self.recent_count, &self.summaries, self.preview_limit);
            if candidate.len() / 4 <= self.max_history_tokens {
                return candidate;
            }
            if self.preview_shrinks < 2 {
                self.preview_limit = (self.preview_limit / 2).max(MIN_PREVIEW_LIMIT);
                self.preview_shrinks += 1;
                continue;
            }
            if self.recent_count > 1 {
                self.recent_count -= 1;
                continue;
            }
            if !self.summaries.is_empty() {
                self.summaries.clear();
                continue;
            }
            // Hard truncate by characters as the final fallback.
            let max_chars = self.max_history_tokens * 4;
            return truncate_chars(&candidate, max_chars);
        }
    }

    fn render(&self, recent_count: usize, summaries: &[String], preview_limit: usize) -> String {
        let mut out = String::new();
        for summary in summaries {
            out.push_str("[summary] ");
            out.push_str(summary);
            out.push('\n');
        }
        let start = self.exchanges.len().saturating_sub(recent_count);
        for exchange in &self.exchanges[start..] {
            out.push_str(&format!(
                "--- iteration {} ---\ncode:\n{}\noutput:\n{}\n",
                exchange.iteration,
                truncate_chars(&exchange.code, preview_limit),
                truncate_chars(&exchange.output, preview_limit),
            ));
            if let Some(err) = &exchange.error {
                out.push_str("error:\n");
                out.push_str(&truncate_chars(err, preview_limit));
                out.push('\n');
            }
        }
        out
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}\n[truncated]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(i: usize, len: usize) -> Exchange {
        Exchange {
            iteration: i,
            code: "x".repeat(len),
            output: "y".repeat(len),
            error: None,
        }
    }

    #[test]
    fn fits_within_budget_without_degrading() {
        let mut history = ConversationHistory::new(3, 10_000);
        history.push(exchange(1, 100));
        let rendered = history.format_for_prompt();
        assert!(rendered.contains("iteration 1"));
    }

    #[test]
    fn degrades_under_pressure_and_still_returns() {
        let mut history = ConversationHistory::new(3, 50);
        for i in 1..=5 {
            history.push(exchange(i, 5000));
        }
        history.push_summary("older work summary".to_string());
        let rendered = history.format_for_prompt();
        assert!(rendered.len() / 4 <= 50 || rendered.ends_with("[truncated]"));
    }
}
