// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider error classification (§4.3).
//!
//! `sven_model::ModelProvider` already exposes `stream → chunk channel` and
//! bakes `parse_stream_event` into the provider implementation (the stream
//! it returns yields `ResponseEvent`s directly). What's missing — and what
//! this module supplies — is the error taxonomy the Agent FSM needs to
//! decide retry vs. compact-and-retry vs. give up.

/// How the Agent FSM should react to a failed `stream(...)` call or a
/// reported usage overflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with exponential backoff, up to a cap.
    Transient,
    /// Run emergency compaction then retry immediately; does not count
    /// against the retry budget.
    Overflow,
    /// Report to the user; no retry.
    Permanent,
}

const OVERFLOW_SUBSTRINGS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "maximum context length",
    "context window",
    "exceed_context_size_error",
    "too many tokens",
    "prompt is too long",
    "input is too long",
];

const TRANSIENT_SUBSTRINGS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "dns error",
    "temporarily unavailable",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "handshake",
];

/// Classify a provider error for the FSM's retry policy. `status` is the
/// HTTP status code when known (a 5xx is always transient; a 4xx other
/// than 429 is presumed permanent unless its message matches an overflow
/// substring).
pub fn classify_error(message: &str, status: Option<u16>) -> ErrorKind {
    let lower = message.to_lowercase();
    if OVERFLOW_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return ErrorKind::Overflow;
    }
    if let Some(code) = status {
        if code == 429 || (500..600).contains(&code) {
            return ErrorKind::Transient;
        }
        if (400..500).contains(&code) {
            return ErrorKind::Permanent;
        }
    }
    if TRANSIENT_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return ErrorKind::Transient;
    }
    ErrorKind::Permanent
}

/// Usage-based overflow detection (§4.3, §4.8): a provider silently
/// truncated the prompt but still reported a real `prompt_tokens` count
/// that exceeds the model's context window.
pub fn usage_exceeds_window(prompt_tokens: u32, context_window: u32) -> bool {
    context_window > 0 && prompt_tokens > context_window
}

/// Exponential backoff delay for the `n`th (1-indexed) retry, capped at
/// `cap_ms`. Monotonically non-decreasing per §8 testable property 6.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    exp.min(cap_ms)
}
