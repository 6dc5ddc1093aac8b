//! Sentence segmentation and caption timing for sync maps.
//!
//! Splitting rules:
//! - A sentence ends at a word whose last character is `.`, `?` or `!`,
//!   optionally followed by closing quotes or brackets (`"Hi." Then` splits).
//! - Runs of terminators stay together (`Really?!`, `Wait...`).
//! - Terminators inside a word do not split (`$9.99`, `example.com`).
//! - Common abbreviations ending in `.` do not split (`Dr. Smith`).
//! - Text without terminal punctuation is one segment; empty or
//!   whitespace-only text yields no segments.
//! - Whitespace inside a sentence is collapsed to single spaces.
//!
//! Durations are estimated at 15 characters per second, clamped to 2..=6
//! seconds, with a 0.5 second gap between segments.

use serde::{Deserialize, Serialize};

pub const CHARS_PER_SECOND: f64 = 15.0;
pub const MIN_SEGMENT_SECS: f64 = 2.0;
pub const MAX_SEGMENT_SECS: f64 = 6.0;
pub const SEGMENT_GAP_SECS: f64 = 0.5;

const TERMINATORS: [char; 3] = ['.', '?', '!'];
const CLOSERS: [char; 7] = ['"', '\'', ')', ']', '}', '\u{201D}', '\u{2019}'];
const ABBREVIATIONS: [&str; 16] = [
    "mr.", "mrs.", "ms.", "dr.", "prof.", "st.", "sr.", "jr.", "vs.", "etc.", "e.g.", "i.e.",
    "inc.", "ltd.", "co.", "no.",
];

/// One timed caption line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// 1-based position in the sync map
    pub index: u32,
    pub text: String,
    pub duration: f64,
    pub start_time: f64,
}

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);

        if ends_sentence(word) {
            sentences.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        sentences.push(current);
    }

    sentences
}

fn ends_sentence(word: &str) -> bool {
    let stripped = word.trim_end_matches(CLOSERS);
    if !stripped.ends_with(TERMINATORS) {
        return false;
    }

    // Only a bare period can belong to an abbreviation.
    if stripped.ends_with('.') && !stripped.ends_with("..") {
        let lowered = stripped
            .trim_start_matches(['"', '\'', '(', '[', '\u{201C}', '\u{2018}'])
            .to_lowercase();
        if ABBREVIATIONS.contains(&lowered.as_str()) {
            return false;
        }
    }

    true
}

/// Heuristic spoken duration for a caption, in seconds.
pub fn estimate_duration(text: &str) -> f64 {
    let chars = text.chars().count() as f64;
    (chars / CHARS_PER_SECOND).clamp(MIN_SEGMENT_SECS, MAX_SEGMENT_SECS)
}

/// Segments `prompt` and assigns cumulative start times.
pub fn build_sync_map(prompt: &str) -> Vec<Segment> {
    let mut cursor = 0.0;
    split_sentences(prompt)
        .into_iter()
        .enumerate()
        .map(|(idx, text)| {
            let duration = estimate_duration(&text);
            let segment = Segment {
                index: idx as u32 + 1,
                text,
                duration,
                start_time: cursor,
            };
            cursor += duration + SEGMENT_GAP_SECS;
            segment
        })
        .collect()
}

/// End time of the last segment, 0 for an empty map.
pub fn total_duration(segments: &[Segment]) -> f64 {
    segments
        .last()
        .map(|s| s.start_time + s.duration)
        .unwrap_or(0.0)
}
