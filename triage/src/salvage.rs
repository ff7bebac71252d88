//! Structured-text salvage for near-miss LLM JSON output.
//!
//! Models routinely wrap JSON in markdown fences, leave trailing commas, use
//! single quotes, forget to quote keys, or get cut off mid-object when they hit
//! the token limit. [`salvage`] rewrites such text into something
//! `serde_json` can parse. It is a heuristic, not a parser: it never fails and
//! never validates semantics. The caller's subsequent parse is the judge.
//!
//! ## Passes (in order)
//!
//! | # | Pass                                                     |
//! |---|----------------------------------------------------------|
//! | 1 | strip leading/trailing markdown code fences              |
//! | 2 | strip `//` and `/* */` comments outside strings          |
//! | 3 | drop one stray character glued to the front of a key     |
//! | 4 | discard preamble before the first `{` or `[`             |
//! | 5 | truncate at the matching closer, or close a cut-off tail |
//! | 6 | remove trailing commas                                   |
//! | 7 | quote bare object keys                                   |
//! | 8 | convert single-quoted strings to double-quoted           |
//! | 9 | escape raw newlines, tabs and CRs inside strings         |

/// Best-effort rewrite of probably-JSON text into valid JSON text.
///
/// Returns the input unchanged when it is empty or contains no `{` / `[`.
pub fn salvage(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let text = strip_code_fences(raw);
    let text = strip_comments(text);
    let text = drop_stray_key_prefix(&text);

    let Some(start) = text.find(['{', '[']) else {
        return raw.to_string();
    };

    let text = close_structure(&text[start..]);
    let text = remove_trailing_commas(&text);
    let text = quote_bare_keys(&text);
    let text = convert_single_quotes(&text);
    escape_control_chars(&text)
}

// ── Lexical state ────────────────────────────────────────────────────────────

/// Tracks whether a character stream is inside a string literal.
///
/// Double quotes always open a string. A single quote only opens one where a
/// key or value may start (after `{`, `[`, `,`, `:` or at the beginning), so
/// apostrophes in stray prose do not flip the state.
#[derive(Debug, Default)]
struct StringState {
    quote: Option<char>,
    escaped: bool,
    last_significant: Option<char>,
}

impl StringState {
    fn in_string(&self) -> bool {
        self.quote.is_some()
    }

    /// Whether a single quote at the current position would open a string.
    fn single_quote_opens(&self) -> bool {
        matches!(self.last_significant, None | Some('{' | '[' | ',' | ':'))
    }

    /// Feed one character. Returns `true` when the character belongs to a
    /// string literal, delimiters included.
    fn feed(&mut self, c: char) -> bool {
        if let Some(quote) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == quote {
                self.quote = None;
                self.last_significant = Some(c);
            }
            return true;
        }

        if c == '"' || (c == '\'' && self.single_quote_opens()) {
            self.quote = Some(c);
            return true;
        }

        if !c.is_whitespace() {
            self.last_significant = Some(c);
        }
        false
    }
}

// ── Pass 1: code fences ──────────────────────────────────────────────────────

fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();

    if text.starts_with("```") {
        // Drop the whole opening fence line, including a language tag.
        text = match text.find('\n') {
            Some(newline) => &text[newline + 1..],
            None => text.trim_start_matches('`'),
        };
    }

    let trimmed_end = text.trim_end();
    if let Some(body) = trimmed_end.strip_suffix("```") {
        text = body;
    }

    text.trim()
}

// ── Pass 2: comments ─────────────────────────────────────────────────────────

fn strip_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut state = StringState::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if !state.in_string() && c == '/' {
            match chars.get(i + 1) {
                Some('/') => {
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                    continue;
                }
                Some('*') => {
                    i += 2;
                    while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/'))
                    {
                        i += 1;
                    }
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }

        state.feed(c);
        out.push(c);
        i += 1;
    }

    out
}

// ── Pass 3: stray character before a key ─────────────────────────────────────

/// Drops one non-quote character wedged between a `{`/`,` and a quoted key,
/// e.g. `{ x"title": 1 }` or `,\n  _"labels": []`.
fn drop_stray_key_prefix(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut state = StringState::default();

    for (i, &c) in chars.iter().enumerate() {
        let at_key_start = !state.in_string() && matches!(state.last_significant, Some('{' | ','));
        if at_key_start
            && is_stray(c)
            && chars.get(i + 1) == Some(&'"')
            && quoted_key_follows(&chars, i + 1)
        {
            continue;
        }
        state.feed(c);
        out.push(c);
    }

    out
}

fn is_stray(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '"' | '\'' | '{' | '}' | '[' | ']' | ',' | ':')
}

/// Whether the double-quoted string starting at `open` is followed by a colon.
fn quoted_key_follows(chars: &[char], open: usize) -> bool {
    let mut escaped = false;
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i];
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return chars[i + 1..]
                .iter()
                .find(|c| !c.is_whitespace())
                .is_some_and(|&c| c == ':');
        } else if c == '\n' {
            return false;
        }
        i += 1;
    }
    false
}

// ── Pass 5: structure closing ────────────────────────────────────────────────

/// One open container on the bracket stack.
#[derive(Debug, Clone, Copy)]
struct Frame {
    closer: char,
    /// In an object: a `:` has been seen since the last key started.
    after_colon: bool,
}

impl Frame {
    fn expects_value(self) -> bool {
        self.closer == ']' || self.after_colon
    }
}

/// Truncates at the closer matching the first opener. When the structure was
/// cut off, rewinds to the last point where every emitted value was complete
/// and appends the closers still owed.
fn close_structure(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut state = StringState::default();
    let mut frames: Vec<Frame> = Vec::new();
    // (char index to cut at, frames still open at that point)
    let mut safe_point: Option<(usize, Vec<Frame>)> = None;

    for (i, &c) in chars.iter().enumerate() {
        let was_in_string = state.in_string();
        if state.feed(c) {
            let closed_now = was_in_string && !state.in_string();
            if closed_now && frames.last().is_some_and(|f| f.expects_value()) {
                safe_point = Some((i + 1, frames.clone()));
            }
            continue;
        }

        match c {
            '{' | '[' => {
                frames.push(Frame {
                    closer: if c == '{' { '}' } else { ']' },
                    after_colon: false,
                });
                safe_point = Some((i + 1, frames.clone()));
            }
            '}' | ']' => {
                frames.pop();
                if frames.is_empty() {
                    return chars[..=i].iter().collect();
                }
                safe_point = Some((i + 1, frames.clone()));
            }
            ':' => {
                if let Some(frame) = frames.last_mut() {
                    frame.after_colon = true;
                }
            }
            ',' => {
                safe_point = Some((i, frames.clone()));
                if let Some(frame) = frames.last_mut() {
                    frame.after_colon = false;
                }
            }
            _ => {}
        }
    }

    let (cut, open) = safe_point.unwrap_or((0, Vec::new()));
    let mut out: String = chars[..cut].iter().collect();
    let kept = out.trim_end().len();
    out.truncate(kept);
    if out.ends_with(',') {
        out.pop();
    }
    for frame in open.iter().rev() {
        out.push(frame.closer);
    }
    out
}

// ── Pass 6: trailing commas ──────────────────────────────────────────────────

fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut state = StringState::default();

    for (i, &c) in chars.iter().enumerate() {
        let in_string = state.feed(c);
        if !in_string && c == ',' {
            let next = chars[i + 1..].iter().copied().find(|c| !c.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                continue;
            }
        }
        out.push(c);
    }

    out
}

// ── Pass 7: bare keys ────────────────────────────────────────────────────────

fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut state = StringState::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let key_position =
            !state.in_string() && matches!(state.last_significant, Some('{' | ','));

        if key_position && (c.is_alphabetic() || c == '_' || c == '$') {
            let mut end = i;
            while end < chars.len()
                && (chars[end].is_alphanumeric() || matches!(chars[end], '_' | '$' | '-'))
            {
                end += 1;
            }
            let colon_follows = chars[end..]
                .iter()
                .find(|c| !c.is_whitespace())
                .is_some_and(|&c| c == ':');

            if colon_follows {
                out.push('"');
                out.extend(&chars[i..end]);
                out.push('"');
                state.last_significant = Some('"');
                i = end;
                continue;
            }
        }

        state.feed(c);
        out.push(c);
        i += 1;
    }

    out
}

// ── Pass 8: single quotes ────────────────────────────────────────────────────

fn convert_single_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut state = StringState::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\'' && !state.in_string() && state.single_quote_opens() {
            out.push('"');
            i += 1;
            let mut escaped = false;
            while i < chars.len() {
                let inner = chars[i];
                i += 1;
                if escaped {
                    // \' no longer needs escaping once the delimiter is "
                    if inner != '\'' {
                        out.push('\\');
                    }
                    out.push(inner);
                    escaped = false;
                } else if inner == '\\' {
                    escaped = true;
                } else if inner == '\'' {
                    break;
                } else if inner == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(inner);
                }
            }
            out.push('"');
            state.last_significant = Some('"');
            continue;
        }

        state.feed(c);
        out.push(c);
        i += 1;
    }

    out
}

// ── Pass 9: control characters inside strings ────────────────────────────────

fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut state = StringState::default();

    for c in text.chars() {
        let was_in_string = state.in_string();
        state.feed(c);
        if was_in_string {
            match c {
                '\n' => {
                    out.push_str("\\n");
                    continue;
                }
                '\r' => {
                    out.push_str("\\r");
                    continue;
                }
                '\t' => {
                    out.push_str("\\t");
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }

    out
}
