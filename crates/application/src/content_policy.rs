//! 消息内容过滤
//!
//! 纯函数式的内容检查：去除首尾空白 -> 危险标记检测 -> 屏蔽词替换 ->
//! 全大写转小写 -> 长度截断 -> 空消息检查。任何一步都不做 I/O。

use domain::MessageKind;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// 屏蔽词的替换字符
pub const MASK_CHAR: char = '*';

/// 超过该字符数才做大写比例检查
const SHOUTING_MIN_CHARS: usize = 10;
const SHOUTING_RATIO: f64 = 0.7;

static MARKUP_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("script_block", r"(?is)<script\b[^>]*>.*?</script\s*>"),
        ("script_tag", r"(?i)</?script\b[^>]*>"),
        ("event_handler", r"(?i)\bon[a-z]+\s*="),
        ("iframe", r"(?i)<iframe\b"),
        ("object", r"(?i)<object\b"),
        ("embed", r"(?i)<embed\b"),
        ("form", r"(?i)<form\b"),
        ("meta", r"(?i)<meta\b"),
        ("link", r"(?i)<link\b"),
        ("javascript_url", r"(?i)javascript\s*:"),
        ("vbscript_url", r"(?i)vbscript\s*:"),
        ("css_expression", r"(?i)expression\s*\("),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("markup pattern must compile")))
    .collect()
});

static UPPERCASE_LETTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-ZА-ЯЁ]").expect("uppercase pattern must compile"));

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid banned word '{word}': {source}")]
    InvalidBannedWord {
        word: String,
        #[source]
        source: regex::Error,
    },
}

/// 单次检查中发现的问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// 命中危险标记，消息会被拒绝
    Markup { pattern: &'static str },
    /// 命中屏蔽词，已替换
    BannedWord { word: String },
    /// 大写比例过高，已转小写
    Shouting,
    /// 超长，已截断
    Truncated { original_chars: usize, max_chars: usize },
    /// 过滤后为空的文本消息
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub accepted: bool,
    pub sanitized_text: String,
    pub violations: Vec<Violation>,
}

impl PolicyVerdict {
    /// 被拒绝时给发送者的说明
    pub fn rejection_reason(&self) -> Option<&'static str> {
        if self.accepted {
            return None;
        }
        let reason = if self
            .violations
            .iter()
            .any(|violation| matches!(violation, Violation::Markup { .. }))
        {
            "message contains forbidden markup"
        } else {
            "message cannot be empty"
        };
        Some(reason)
    }
}

struct BannedWord {
    word: String,
    pattern: Regex,
}

pub struct ContentPolicy {
    banned_words: Vec<BannedWord>,
    max_chars: Option<usize>,
}

impl ContentPolicy {
    /// `max_chars` 为 `None` 时不截断
    pub fn new<I, S>(banned_words: I, max_chars: Option<usize>) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let banned_words = banned_words
            .into_iter()
            .map(|word| word.as_ref().trim().to_owned())
            .filter(|word| !word.is_empty())
            .map(|word| {
                let pattern = Regex::new(&format!("(?i){}", regex::escape(&word)))
                    .map_err(|source| PolicyError::InvalidBannedWord {
                        word: word.clone(),
                        source,
                    })?;
                Ok(BannedWord { word, pattern })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        Ok(Self {
            banned_words,
            max_chars,
        })
    }

    pub fn max_chars(&self) -> Option<usize> {
        self.max_chars
    }

    pub fn evaluate(&self, raw_text: &str, kind: MessageKind, has_attachment: bool) -> PolicyVerdict {
        let mut violations = Vec::new();
        let mut text = raw_text.trim().to_owned();

        let mut markup_found = false;
        for (name, pattern) in MARKUP_PATTERNS.iter() {
            if pattern.is_match(&text) {
                markup_found = true;
                violations.push(Violation::Markup { pattern: *name });
                text = pattern.replace_all(&text, "").into_owned();
            }
        }
        if markup_found {
            text = text.trim().to_owned();
        }

        for banned in &self.banned_words {
            if banned.pattern.is_match(&text) {
                violations.push(Violation::BannedWord {
                    word: banned.word.clone(),
                });
                text = banned
                    .pattern
                    .replace_all(&text, |caps: &regex::Captures<'_>| {
                        MASK_CHAR.to_string().repeat(caps[0].chars().count())
                    })
                    .into_owned();
            }
        }

        if is_shouting(&text) {
            violations.push(Violation::Shouting);
            text = text.to_lowercase();
        }

        if let Some(max_chars) = self.max_chars {
            let original_chars = text.chars().count();
            if original_chars > max_chars {
                text = text.chars().take(max_chars).collect();
                violations.push(Violation::Truncated {
                    original_chars,
                    max_chars,
                });
            }
        }

        let mut accepted = !markup_found;
        if text.trim().is_empty() && kind == MessageKind::Text && !has_attachment {
            violations.push(Violation::Empty);
            accepted = false;
        }

        PolicyVerdict {
            accepted,
            sanitized_text: text,
            violations,
        }
    }
}

fn is_shouting(text: &str) -> bool {
    let total = text.chars().count();
    if total <= SHOUTING_MIN_CHARS {
        return false;
    }
    let upper = UPPERCASE_LETTER.find_iter(text).count();
    upper as f64 / total as f64 > SHOUTING_RATIO
}
