//! The alphabetical-words feed: sentences whose words start in alphabetical order.

use super::FeedPolicy;
use crate::types::CreateOp;
use serde::{Deserialize, Serialize};

/// Shortname of the alphabetical-words feed.
pub const SHORTNAME: &str = "alphabeticwords";

/// Characters a post may contain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charset {
    /// 7-bit ASCII only.
    Ascii,
    /// Latin-1 range, up to U+00FF.
    #[default]
    ExtendedAscii,
}

impl Charset {
    pub fn allows(self, text: &str) -> bool {
        let max = match self {
            Charset::Ascii => '\u{7f}',
            Charset::ExtendedAscii => '\u{ff}',
        };
        text.chars().all(|c| c <= max)
    }
}

/// Tunables for [`AlphabeticalWords`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Only top-level posts match.
    pub reject_replies: bool,

    /// Drop posts with NSFW self-labels or blocked hashtags.
    pub reject_nsfw: bool,

    /// Self-label values treated as NSFW.
    pub nsfw_labels: Vec<String>,

    /// Hashtags (with `#`, lowercase) that exclude a post.
    pub blocked_hashtags: Vec<String>,

    pub charset: Charset,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            reject_replies: true,
            reject_nsfw: true,
            nsfw_labels: ["porn", "sexual", "nudity", "nsfw"]
                .into_iter()
                .map(String::from)
                .collect(),
            blocked_hashtags: [
                "#nsfw", "#bdsm", "#kink", "#porn", "#nude", "#nudes", "#lewd", "#fetish",
                "#onlyfans",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            charset: Charset::ExtendedAscii,
        }
    }
}

/// Whether the words of `text` start in non-decreasing order.
///
/// Words are split on single spaces after lowercasing, so runs of spaces
/// yield empty words whose "first letter" is the empty string. Single-word
/// texts never match, and the first word must start with a letter or digit.
pub fn words_in_order(text: &str) -> bool {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split(' ').collect();
    if words.len() <= 1 {
        return false;
    }

    let first_letters: Vec<&str> = words
        .iter()
        .map(|word| match word.chars().next() {
            Some(c) => &word[..c.len_utf8()],
            None => "",
        })
        .collect();

    let starts_alphanumeric = |s: &str| s.chars().next().is_some_and(char::is_alphanumeric);
    if !starts_alphanumeric(first_letters[0]) {
        return false;
    }
    if !first_letters.iter().any(|s| starts_alphanumeric(s)) {
        return false;
    }

    first_letters.windows(2).all(|pair| pair[0] <= pair[1])
}

/// Posts whose words are in alphabetical order, e.g. "apple banana cherry".
#[derive(Clone, Debug, Default)]
pub struct AlphabeticalWords {
    config: ClassifierConfig,
}

impl AlphabeticalWords {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn is_nsfw(&self, op: &CreateOp) -> bool {
        let labelled = op
            .record
            .label_values()
            .any(|val| self.config.nsfw_labels.iter().any(|l| l == val));
        if labelled {
            return true;
        }

        op.record.text.split_whitespace().any(|token| {
            let tag = token
                .trim_end_matches(|c: char| c.is_ascii_punctuation() && c != '#')
                .to_lowercase();
            tag.starts_with('#') && self.config.blocked_hashtags.iter().any(|b| *b == tag)
        })
    }
}

impl FeedPolicy for AlphabeticalWords {
    fn name(&self) -> &str {
        SHORTNAME
    }

    fn accept(&self, op: &CreateOp) -> bool {
        if self.config.reject_replies && op.record.reply.is_some() {
            return false;
        }
        if self.config.reject_nsfw && self.is_nsfw(op) {
            return false;
        }
        if !self.accept_text(&op.record.text) {
            return false;
        }

        tracing::debug!(feed = SHORTNAME, uri = %op.uri, text = %op.record.text, "post matched");
        true
    }

    fn accept_text(&self, text: &str) -> bool {
        self.config.charset.allows(text) && words_in_order(text)
    }
}
