//! Approximate token cost estimation for mixed-script text.
//!
//! The backend's real tokenizer is unavailable client-side, so every layer of
//! the context engine prices text with [`estimate`]. Costs are tuned for the
//! mix a terminal user actually produces: English prose and shell commands,
//! Korean/Japanese/Chinese questions, punctuation-heavy paths, the odd emoji.
//!
//! | Class | Cost |
//! |-------|------|
//! | Latin alphanumerics + whitespace | `run_length / 4` per contiguous run |
//! | Hangul, CJK ideographs | 1.5 per char |
//! | Kana | 1.2 per char |
//! | Punctuation set | 0.5 per char |
//! | Code points above U+FFFF | 1.5 per char |
//! | Anything else | 1.5 per char |
//!
//! Accumulation is done in exact twentieths so that the final ceiling never
//! suffers from floating-point drift (`5 × 1.2` must be 6, not 7).

/// Bumped whenever the cost table changes. Persisted alongside topic costs so
/// stale values are re-estimated on load.
pub const ESTIMATOR_VERSION: u32 = 2;

/// Fixed-point denominator: every weight below is expressed in twentieths.
const SCALE: u64 = 20;

const WIDE_COST: u64 = 30; // 1.5
const KANA_COST: u64 = 24; // 1.2
const PUNCT_COST: u64 = 10; // 0.5
const RUN_COST_PER_CHAR: u64 = 5; // 1/4

/// Non-ASCII punctuation priced like ASCII punctuation.
const WIDE_PUNCTUATION: &[char] = &[
    '。', '、', '，', '．', '！', '？', '：', '；', '「', '」', '『', '』', '（', '）', '【', '】',
    '《', '》', '〈', '〉', '・', '…', '—', '–', '“', '”', '‘', '’', '·',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Run,
    Wide,
    Kana,
    Punct,
    Other,
}

fn classify(c: char) -> CharClass {
    let cp = c as u32;
    if c.is_ascii_alphanumeric() || c.is_whitespace() || is_latin_letter(cp) {
        CharClass::Run
    } else if is_hangul(cp) || is_cjk_ideograph(cp) {
        CharClass::Wide
    } else if is_kana(cp) {
        CharClass::Kana
    } else if c.is_ascii_punctuation() || WIDE_PUNCTUATION.contains(&c) {
        CharClass::Punct
    } else {
        // Astral code points (emoji, rare CJK) land here too: one Rust
        // `char` regardless of their UTF-16 surrogate width.
        CharClass::Other
    }
}

fn is_latin_letter(cp: u32) -> bool {
    // Latin-1 Supplement letters plus Latin Extended-A/B, minus × and ÷.
    (0x00C0..=0x024F).contains(&cp) && cp != 0x00D7 && cp != 0x00F7
}

fn is_hangul(cp: u32) -> bool {
    (0xAC00..=0xD7A3).contains(&cp)
        || (0x1100..=0x11FF).contains(&cp)
        || (0x3130..=0x318F).contains(&cp)
}

fn is_cjk_ideograph(cp: u32) -> bool {
    (0x4E00..=0x9FFF).contains(&cp)
        || (0x3400..=0x4DBF).contains(&cp)
        || (0xF900..=0xFAFF).contains(&cp)
}

fn is_kana(cp: u32) -> bool {
    (0x3040..=0x309F).contains(&cp)
        || (0x30A0..=0x30FF).contains(&cp)
        || (0xFF66..=0xFF9F).contains(&cp)
}

/// Estimate the backend cost of `text` in approximate tokens.
///
/// Pure and allocation-free; cheap enough to run on every turn and on every
/// status query without caching.
pub fn estimate(text: &str) -> usize {
    let mut total: u64 = 0;
    let mut run_len: u64 = 0;

    for c in text.chars() {
        let class = classify(c);
        if class == CharClass::Run {
            run_len += 1;
            continue;
        }
        total += run_len * RUN_COST_PER_CHAR;
        run_len = 0;
        total += match class {
            CharClass::Wide | CharClass::Other => WIDE_COST,
            CharClass::Kana => KANA_COST,
            CharClass::Punct => PUNCT_COST,
            CharClass::Run => 0,
        };
    }
    total += run_len * RUN_COST_PER_CHAR;

    total.div_ceil(SCALE) as usize
}
