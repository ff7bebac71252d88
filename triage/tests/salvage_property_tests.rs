//! Salvage property tests: seeded random JSON documents run through
//! [`triage::salvage`].
//!
//! Tests verify:
//! - Valid JSON, compact or pretty, comes back byte-for-byte
//! - Fenced JSON parses back to the same value
//! - Prose around valid JSON is dropped without touching the document

use serde_json::{Map, Value};
use triage::salvage;

/// Strings that look like the things salvage rewrites.
const FRAGMENTS: &[&str] = &[
    "it's broken",
    "don't retry",
    "'single'",
    "// not a comment",
    "/* not a comment */",
    "http://example.com/a//b",
    "say \"hi\"",
    "x\"title\": 1",
    "line one\nline two",
    "crlf\r\nend",
    "tab\there",
    "back\\slash",
    "{",
    "}]",
    ", ",
    "trailing,",
    ": ",
    "```json",
    "café ☕",
    "",
];

const KEYS: &[&str] = &[
    "title",
    "labels",
    "it's",
    "a//b",
    "/*k*/",
    "with \"quote\"",
    "multi\nline",
    "$ref",
    "x-y",
    "_",
];

/// SplitMix64; enough to vary the documents from seed to seed.
struct Rng(u64);

impl Rng {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[self.below(items.len())]
    }
}

fn random_string(rng: &mut Rng) -> String {
    (0..1 + rng.below(3)).map(|_| rng.pick(FRAGMENTS)).collect()
}

fn random_scalar(rng: &mut Rng) -> Value {
    match rng.below(6) {
        0 => Value::Null,
        1 => Value::Bool(rng.below(2) == 0),
        2 => Value::from(rng.next_u64() as i64 >> 20),
        // Binary fractions survive the text round trip exactly.
        3 => Value::from([0.5, -1.25, 1024.0, 0.0][rng.below(4)]),
        _ => Value::String(random_string(rng)),
    }
}

fn random_value(rng: &mut Rng, depth: usize) -> Value {
    if depth == 0 {
        return random_scalar(rng);
    }
    match rng.below(4) {
        0 => random_scalar(rng),
        1 => Value::Array(
            (0..rng.below(4))
                .map(|_| random_value(rng, depth - 1))
                .collect(),
        ),
        _ => random_object(rng, depth - 1),
    }
}

fn random_object(rng: &mut Rng, depth: usize) -> Value {
    let mut map = Map::new();
    for _ in 0..rng.below(5) {
        let key = match rng.below(3) {
            0 => random_string(rng),
            _ => rng.pick(KEYS).to_string(),
        };
        map.insert(key, random_value(rng, depth));
    }
    Value::Object(map)
}

fn documents() -> impl Iterator<Item = (u64, Value)> {
    (0..400u64).map(|seed| {
        let mut rng = Rng(seed);
        (seed, random_object(&mut rng, 4))
    })
}

fn renderings(value: &Value) -> [String; 2] {
    [
        serde_json::to_string(value).unwrap(),
        serde_json::to_string_pretty(value).unwrap(),
    ]
}

// ── Property: valid JSON is a fixed point ──────────────────────────

#[test]
fn prop_valid_json_is_returned_unchanged() {
    for (seed, value) in documents() {
        for text in renderings(&value) {
            let fixed = salvage(&text);
            assert_eq!(fixed, text, "seed={seed}: salvage rewrote valid JSON");
            let parsed: Value = serde_json::from_str(&fixed).unwrap();
            assert_eq!(parsed, value, "seed={seed}");
        }
    }
}

// ── Property: code fences come off cleanly ─────────────────────────

#[test]
fn prop_fenced_json_parses_to_the_same_value() {
    for (seed, value) in documents() {
        for text in renderings(&value) {
            let fenced = format!("```json\n{text}\n```");
            let parsed: Value = serde_json::from_str(&salvage(&fenced))
                .unwrap_or_else(|e| panic!("seed={seed}: {e}"));
            assert_eq!(parsed, value, "seed={seed}");
        }
    }
}

// ── Property: surrounding prose is dropped ─────────────────────────

#[test]
fn prop_prose_around_json_is_dropped() {
    for (seed, value) in documents() {
        let text = serde_json::to_string_pretty(&value).unwrap();
        let chatty = format!("Sure thing\n{text}\nLet me know if that helps");
        assert_eq!(salvage(&chatty), text, "seed={seed}");
    }
}
