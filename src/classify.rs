//! Deterministic prompt-complexity classifier.
//!
//! Scores the last user utterance on twelve weighted dimensions, folds them
//! into a composite score in `[0, 1]`, buckets that into a [`Tier`], and
//! attaches a sigmoid-calibrated confidence. The classifier is pure: for
//! fixed weights and thresholds the same `(text, meta)` always produces the
//! same result, and nothing here touches I/O or global state after startup.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;

/// Sigmoid steepness for confidence calibration. Scores sitting exactly on a
/// tier boundary come out at confidence 0.5; a distance of 0.1 from the
/// boundary is already ~0.73.
const CONFIDENCE_STEEPNESS: f64 = 10.0;

/// Coarse complexity bucket. The ordering `simple < standard < complex` is
/// load-bearing: session pins and step-ups compare tiers with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Simple,
    Standard,
    Complex,
}

impl Tier {
    /// The next tier up, saturating at `complex`.
    pub fn step_up(self) -> Self {
        match self {
            Self::Simple => Self::Standard,
            Self::Standard | Self::Complex => Self::Complex,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Standard => "standard",
            Self::Complex => "complex",
        })
    }
}

/// Per-dimension weights. Loaded from `classifier.weightsPath` when set;
/// otherwise the built-in defaults apply. `simple_indicators` is the one
/// dimension expected to carry a negative weight - it pulls greetings and
/// one-liners down toward the simple tier.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Weights {
    pub token_count: f64,
    pub code_presence: f64,
    pub reasoning_markers: f64,
    pub simple_indicators: f64,
    pub multi_step_patterns: f64,
    pub question_count: f64,
    pub system_prompt_signals: f64,
    pub conversation_depth: f64,
    pub agentic_task: f64,
    pub technical_terms: f64,
    pub constraint_count: f64,
    pub escalation_signals: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            token_count: 0.12,
            code_presence: 0.18,
            reasoning_markers: 0.12,
            simple_indicators: -0.25,
            multi_step_patterns: 0.14,
            question_count: 0.06,
            system_prompt_signals: 0.08,
            conversation_depth: 0.06,
            agentic_task: 0.16,
            technical_terms: 0.12,
            constraint_count: 0.08,
            escalation_signals: 0.08,
        }
    }
}

impl Weights {
    /// Load weights from a JSON file, falling back field-by-field to defaults.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading classifier weights {}", path.display()))?;
        serde_json::from_str(&content).context("parsing classifier weights JSON")
    }
}

/// The twelve raw dimension scores, each in `[0, 1]`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimensions {
    pub token_count: f64,
    pub code_presence: f64,
    pub reasoning_markers: f64,
    pub simple_indicators: f64,
    pub multi_step_patterns: f64,
    pub question_count: f64,
    pub system_prompt_signals: f64,
    pub conversation_depth: f64,
    pub agentic_task: f64,
    pub technical_terms: f64,
    pub constraint_count: f64,
    pub escalation_signals: f64,
}

/// Non-text context the classifier may consider.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptMeta<'a> {
    /// Total message count in the conversation so far.
    pub message_count: usize,
    pub system_prompt: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    /// Composite score, clamped to `[0, 1]`.
    pub score: f64,
    pub tier: Tier,
    /// Sigmoid of the signed distance to the nearest relevant tier boundary.
    pub confidence: f64,
    pub dimensions: Dimensions,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    weights: Weights,
    thresholds: Thresholds,
}

impl Classifier {
    pub fn new(weights: Weights, thresholds: Thresholds) -> Self {
        Self { weights, thresholds }
    }

    /// Score the last user utterance plus conversation meta.
    pub fn classify(&self, text: &str, meta: PromptMeta<'_>) -> ClassificationResult {
        let started = Instant::now();

        let d = score_dimensions(text, meta);
        let w = &self.weights;

        let raw = w.token_count * d.token_count
            + w.code_presence * d.code_presence
            + w.reasoning_markers * d.reasoning_markers
            + w.simple_indicators * d.simple_indicators
            + w.multi_step_patterns * d.multi_step_patterns
            + w.question_count * d.question_count
            + w.system_prompt_signals * d.system_prompt_signals
            + w.conversation_depth * d.conversation_depth
            + w.agentic_task * d.agentic_task
            + w.technical_terms * d.technical_terms
            + w.constraint_count * d.constraint_count
            + w.escalation_signals * d.escalation_signals;
        let score = raw.clamp(0.0, 1.0);

        let tier = if score <= self.thresholds.simple_max {
            Tier::Simple
        } else if score >= self.thresholds.complex_min {
            Tier::Complex
        } else {
            Tier::Standard
        };

        // Signed distance from the nearest relevant boundary; negative when
        // the score sits on the wrong side, which the sigmoid maps below 0.5.
        let distance = match tier {
            Tier::Simple => self.thresholds.simple_max - score,
            Tier::Complex => score - self.thresholds.complex_min,
            Tier::Standard => f64::min(
                score - self.thresholds.simple_max,
                self.thresholds.complex_min - score,
            ),
        };
        let confidence = sigmoid(CONFIDENCE_STEEPNESS * distance);

        ClassificationResult {
            score,
            tier,
            confidence,
            dimensions: d,
            elapsed: started.elapsed(),
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

// ──────────────────────────────────────────────────────────────────────────────
// Dimension scoring - pub(crate) for unit testing
// ──────────────────────────────────────────────────────────────────────────────

const REASONING_MARKERS: &[&str] = &[
    "explain", "why", "step by step", "analyze", "analyse", "because", "reason through",
    "walk me through", "compare", "trade-off", "tradeoff",
];

const SIMPLE_GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "ok", "okay", "yes", "no", "sure",
    "got it", "cool", "great", "ping", "pong",
];

const AGENTIC_VERBS: &[&str] = &[
    "build", "implement", "design", "refactor", "create", "migrate", "integrate",
    "architect", "optimize", "optimise", "debug", "deploy",
];

const TECHNICAL_TERMS: &[&str] = &[
    "api", "database", "schema", "async", "thread", "mutex", "compile", "compiler",
    "kubernetes", "docker", "latency", "throughput", "cache", "regex", "algorithm",
    "recursion", "serialization", "endpoint", "middleware", "concurrency", "protocol",
    "backend", "frontend", "query", "index", "transaction",
];

const CONSTRAINT_MARKERS: &[&str] = &[
    "must", "must not", "should not", "shouldn't", "at least", "at most", "no more than",
    "within", "exactly", "without using", "only use",
];

const ESCALATION_MARKERS: &[&str] = &[
    "urgent", "critical", "asap", "production", "carefully", "thorough", "comprehensive",
    "complex", "complicated", "tricky", "edge case", "edge cases",
];

const CODE_KEYWORDS: &[&str] = &[
    "fn ", "def ", "class ", "impl ", "struct ", "import ", "return ", "const ",
    "let ", "var ", "function ", "#include", "pub fn",
];

/// Count how many of `needles` occur in `haystack` (already lowercased).
fn occurrences(haystack: &str, needles: &[&str]) -> usize {
    needles.iter().filter(|n| haystack.contains(*n)).count()
}

/// Saturating ratio: `count / saturation`, capped at 1.0.
fn saturate(count: usize, saturation: usize) -> f64 {
    (count as f64 / saturation as f64).min(1.0)
}

pub(crate) fn score_dimensions(text: &str, meta: PromptMeta<'_>) -> Dimensions {
    let lower = text.to_lowercase();
    let trimmed = lower.trim();

    // Log-scaled length, saturating around 4k estimated tokens (~4 chars each).
    let est_tokens = (text.len() / 4).max(1) as f64;
    let token_count = (est_tokens.ln() / 4096.0_f64.ln()).clamp(0.0, 1.0);

    let fenced = text.contains("```");
    let inline_backticks = text.matches('`').count() >= 2 && !fenced;
    let keyword_hits = occurrences(&lower, CODE_KEYWORDS);
    let code_presence = if fenced {
        1.0
    } else {
        (0.4 * inline_backticks as u8 as f64 + saturate(keyword_hits, 3) * 0.6).min(1.0)
    };

    let reasoning_markers = saturate(occurrences(&lower, REASONING_MARKERS), 3);

    let word_count = trimmed.split_whitespace().count();
    let is_trivial = word_count <= 2
        || SIMPLE_GREETINGS
            .iter()
            .any(|g| trimmed == *g || trimmed == format!("{g}!") || trimmed == format!("{g}."));
    let greeting_hit = SIMPLE_GREETINGS
        .iter()
        .any(|g| trimmed.starts_with(g) && word_count <= 6);
    let simple_indicators = if is_trivial {
        1.0
    } else if greeting_hit {
        0.5
    } else {
        0.0
    };

    let enumerated = ["1.", "2.", "1)", "2)", "- [ ]"]
        .iter()
        .filter(|m| lower.contains(*m))
        .count();
    let sequenced = ["first", "then", "after that", "finally", "next,"]
        .iter()
        .filter(|m| lower.contains(*m))
        .count();
    let multi_step_patterns = saturate(enumerated + sequenced, 4);

    let question_count = saturate(text.matches('?').count(), 4);

    let system_prompt_signals = meta
        .system_prompt
        .map(|s| {
            let length = (s.len() as f64 / 2000.0).min(0.6);
            let structured = s.lines().count() > 5 || s.contains("- ") || s.contains("##");
            (length + if structured { 0.4 } else { 0.0 }).min(1.0)
        })
        .unwrap_or(0.0);

    let conversation_depth = saturate(meta.message_count, 20);

    let agentic_task = saturate(occurrences(&lower, AGENTIC_VERBS), 2);

    let technical_terms = saturate(occurrences(&lower, TECHNICAL_TERMS), 5);

    let constraint_count = saturate(occurrences(&lower, CONSTRAINT_MARKERS), 3);

    let escalation_signals = saturate(occurrences(&lower, ESCALATION_MARKERS), 2);

    Dimensions {
        token_count,
        code_presence,
        reasoning_markers,
        simple_indicators,
        multi_step_patterns,
        question_count,
        system_prompt_signals,
        conversation_depth,
        agentic_task,
        technical_terms,
        constraint_count,
        escalation_signals,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
