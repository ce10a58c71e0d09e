//! Hallucination filtering
//!
//! Speech-to-text systems reliably produce a small set of low-information
//! phrases on silence, breath and background noise ("thank you", "um", ...).
//! Anything that matches the denylist exactly - case-insensitive, trailing
//! punctuation ignored - is treated the same as "no speech detected" so it
//! never reaches the response generator.

/// The stock denylist. Data, not logic: membership is a product decision.
pub fn default_denylist() -> Vec<String> {
    [
        "thank you",
        "thanks",
        "you",
        "bye",
        "okay",
        "mm-hmm",
        "uh-huh",
        "hmm",
        "um",
        "uh",
        "ah",
        "...",
        "silence",
        "background",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// True if the transcript is a known noise artifact.
pub fn is_hallucination(text: &str, denylist: &[String]) -> bool {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    let stripped = normalized.trim_end_matches(['.', '!', '?', ',']);
    denylist
        .iter()
        .any(|entry| entry == &normalized || entry == stripped)
}
