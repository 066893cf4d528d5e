//! Terminal output sanitization for transport.
//!
//! tmux pane captures and pipe-pane logs carry escape sequences, TUI frame
//! glyphs and prompt decoration that render as noise in a chat message. This
//! module reduces raw terminal text to its readable content:
//!
//! 1. strip escape sequences (CSI, OSC, two-byte escapes) and "orphaned"
//!    bracket sequences whose ESC byte was already lost,
//! 2. strip box-drawing / geometric glyphs and control bytes (tab and newline
//!    survive),
//! 3. collapse blank-line runs and space runs,
//! 4. drop empty, decoration-only and single-character lines,
//! 5. reassemble and trim.
//!
//! The pipeline is applied until it reaches a fixed point, so sanitizing
//! already-sanitized text is a no-op.

use std::sync::LazyLock;

use regex::Regex;

/// Default payload budget for one transport message.
pub const DEFAULT_MAX_LENGTH: usize = 3500;

/// Prepended when [`format_for_transport`] drops older output.
pub const TRUNCATION_MARKER: &str = "...\n";

/// Returned instead of an empty payload.
pub const EMPTY_PLACEHOLDER: &str = "📄 Terminal output is empty or contains only control sequences";

static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // CSI (ESC [ params intermediates final), OSC (ESC ] ... BEL|ST), and the
    // two-byte Fe escapes (ESC + @..Z, \, ], ^, _).
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[@-Z\\-_]")
        .unwrap()
});

static ORPHAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        // SGR with numeric params: [0m, [01;32m, [38;5;208m
        r"\[[0-9]+(?:;[0-9]+)*m",
        // private modes: [?25l, [?2004h, [?1004l, [?1049;1h
        r"|\[\?[0-9]+(?:;[0-9]+)*[hl]",
        // cursor position: [12;1H, [3;4f
        r"|\[[0-9]+;[0-9]+[Hf]",
        // cursor movement / line clearing with a count: [1A, [2K, [3G
        r"|\[[0-9]+[ABCDGJK]",
        // bare cursor movement / clearing: [K, [G, [A (not followed by a word char)
        r"|\[[ABCDGJK]\b",
    ))
    .unwrap()
});

static GLYPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\u{2500}-\u{257F}■□▪▫▲▼◆◇○●△▽]").unwrap()
});

static CONTROL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0B-\x1F\x7F]").unwrap());

static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)*").unwrap());

static SPACE_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

static DECORATION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[>\s\[\]│─╭╮╰╯┐┘└┌├┤┬┴┼]+$").unwrap());

/// Remove escape-introduced and orphaned bracket control sequences.
pub fn strip_control_sequences(input: &str) -> String {
    let stripped = ESCAPE_RE.replace_all(input, "");
    ORPHAN_RE.replace_all(&stripped, "").into_owned()
}

/// Remove frame glyphs and non-printable control bytes (keeps `\t` and `\n`).
pub fn strip_glyphs(input: &str) -> String {
    let stripped = GLYPH_RE.replace_all(input, "");
    CONTROL_RE.replace_all(&stripped, "").into_owned()
}

fn collapse_whitespace(input: &str) -> String {
    let collapsed = BLANK_RUN_RE.replace_all(input, "\n\n");
    SPACE_RUN_RE.replace_all(&collapsed, " ").into_owned()
}

fn keep_line(line: &str) -> bool {
    !line.is_empty() && !DECORATION_LINE_RE.is_match(line) && line.chars().count() > 1
}

fn filter_lines(input: &str) -> String {
    input
        .lines()
        .map(str::trim)
        .filter(|line| keep_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn sanitize_pass(raw: &str) -> String {
    let text = strip_control_sequences(raw);
    let text = strip_glyphs(&text);
    let text = collapse_whitespace(&text);
    filter_lines(&text).trim().to_string()
}

/// Reduce raw terminal text to readable content.
pub fn sanitize(raw: &str) -> String {
    // Every stage only removes characters, so each pass that changes the text
    // makes it strictly shorter and the loop terminates.
    let mut current = sanitize_pass(raw);
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Sanitize and fit terminal text into one transport message.
///
/// Keeps the newest `max_length` characters when the sanitized text is too
/// long, and never returns an empty string.
pub fn format_for_transport(raw: &str, max_length: usize) -> String {
    let clean = sanitize(raw);
    if clean.is_empty() {
        return EMPTY_PLACEHOLDER.to_string();
    }

    let total = clean.chars().count();
    if total <= max_length {
        return clean;
    }

    let tail: String = clean.chars().skip(total - max_length).collect();
    format!("{TRUNCATION_MARKER}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_csi_color_sequences() {
        let input = "\x1b[31mERROR\x1b[0m: something broke";
        assert_eq!(sanitize(input), "ERROR: something broke");
    }

    #[test]
    fn strips_osc_title() {
        let input = "\x1b]0;title\x07some text";
        assert_eq!(sanitize(input), "some text");
    }

    #[test]
    fn strips_orphaned_bracket_sequences() {
        let input = "[01;34mtarget[0m  [38;5;208mCargo.toml[39m\n[?25l[?2004hready[?2004l";
        assert_eq!(sanitize(input), "target Cargo.toml\nready");
    }

    #[test]
    fn keeps_bracketed_words() {
        let input = "[Build] finished\n[Known issue] none";
        assert_eq!(sanitize(input), "[Build] finished\n[Known issue] none");
    }

    #[test]
    fn strips_box_drawing_frames() {
        let input = "╭──────────╮\n│ > hello  │\n╰──────────╯";
        assert_eq!(sanitize(input), "> hello");
    }

    #[test]
    fn strips_control_bytes_but_keeps_tabs() {
        let input = "col1\tcol2\r\n\x07bell\x08";
        assert_eq!(sanitize(input), "col1\tcol2\nbell");
    }

    #[test]
    fn collapses_space_runs() {
        assert_eq!(sanitize("total    42     files"), "total 42 files");
    }

    #[test]
    fn drops_decoration_and_single_char_lines() {
        let input = "first line\n>\n[ ]\nx\n\n\n\nsecond line";
        assert_eq!(sanitize(input), "first line\nsecond line");
    }

    #[test]
    fn control_only_input_yields_placeholder() {
        let input = "\x1b[2J\x1b[H╭───╮\n│   │\n╰───╯\x1b[?25h";
        assert_eq!(sanitize(input), "");
        assert_eq!(
            format_for_transport(input, DEFAULT_MAX_LENGTH),
            EMPTY_PLACEHOLDER
        );
    }

    #[test]
    fn truncation_keeps_newest_output() {
        let raw: String = (0..200).map(|i| format!("line number {i}\n")).collect();
        let formatted = format_for_transport(&raw, 100);
        assert!(formatted.starts_with(TRUNCATION_MARKER));
        assert!(formatted.ends_with("line number 199"));
        assert_eq!(
            formatted.chars().count(),
            100 + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn short_output_is_not_truncated() {
        assert_eq!(format_for_transport("$ ls\nsrc", 100), "$ ls\nsrc");
    }

    #[test]
    fn counts_characters_not_bytes() {
        let raw = "привет мир";
        assert_eq!(format_for_transport(raw, 10), "привет мир");
        assert_eq!(format_for_transport(raw, 3), "...\nмир");
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(raw in "(\\PC|\\x1b|\\[|;|[0-9]|\n| |─|│|m|K|\\?){0,200}") {
            let once = sanitize(&raw);
            prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn transport_output_is_bounded(raw in "(\\PC|\n|\\x1b\\[[0-9]{1,2}m){0,400}", max in 1usize..120) {
            let formatted = format_for_transport(&raw, max);
            let bound = max + TRUNCATION_MARKER.chars().count();
            prop_assert!(formatted == EMPTY_PLACEHOLDER || formatted.chars().count() <= bound);
        }

        #[test]
        fn truncation_preserves_suffix(raw in "([a-z]{2,8}\n){0,80}", max in 5usize..60) {
            let clean = sanitize(&raw);
            let formatted = format_for_transport(&raw, max);
            if let Some(tail) = formatted.strip_prefix(TRUNCATION_MARKER) {
                prop_assert!(clean.ends_with(tail));
            } else if !clean.is_empty() {
                prop_assert_eq!(formatted, clean);
            }
        }
    }
}
