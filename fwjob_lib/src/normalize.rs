//! Cleanup applied to every captured output line before it is stored.

use std::sync::OnceLock;

use fwjob_data::JobAction;
use regex::Regex;

static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();

fn ansi_regex() -> &'static Regex {
    ANSI_ESCAPE.get_or_init(|| {
        // single-byte Fe escapes, or CSI: ESC [ params intermediates final
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid escape pattern")
    })
}

/// Strip ANSI/VT escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// OTA handshake chatter printed while a device log session is attached.
pub fn is_noise(action: JobAction, line: &str) -> bool {
    if action != JobAction::Logs {
        return false;
    }
    let lower = line.to_lowercase();
    lower.contains("esphome.ota") && (lower.contains("handshake") || lower.contains("read magic"))
}

/// Clean one raw line, None when the line is filtered out for this action.
pub fn normalize_line(action: JobAction, raw: &str) -> Option<String> {
    let clean = strip_ansi(raw.trim_matches('\r'));
    if is_noise(action, &clean) {
        None
    } else {
        Some(clean)
    }
}
