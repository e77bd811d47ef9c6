//! Working-directory tracking from shell output.
//!
//! Shells with cwd integration print `ESC ] 7 ; file://host/path` terminated
//! by BEL or ST after every prompt. The tracker picks those out of raw output
//! chunks, carrying an incomplete sequence over to the next chunk.

pub const OSC7_INTRO: &str = "\u{1b}]7;";

/// Largest incomplete sequence carried between chunks. Anything longer is
/// dropped so a never-terminated sequence cannot grow without bound.
pub const MAX_PENDING_BYTES: usize = 4096;

const MAX_URI_BYTES: usize = 2048;

enum Terminator {
    Found { end: usize, len: usize },
    /// Another escape sequence started before this one ended.
    Abandoned { at: usize },
    Incomplete,
}

fn find_terminator(body: &str) -> Terminator {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0x07 => return Terminator::Found { end: i, len: 1 },
            0x1b => {
                return match bytes.get(i + 1) {
                    Some(b'\\') => Terminator::Found { end: i, len: 2 },
                    Some(_) => Terminator::Abandoned { at: i },
                    None => Terminator::Incomplete,
                };
            }
            _ => i += 1,
        }
    }
    Terminator::Incomplete
}

/// Length of the longest suffix of `text` that is a proper prefix of the introducer.
fn partial_intro_suffix(text: &str) -> usize {
    (1..OSC7_INTRO.len())
        .rev()
        .find(|&k| text.ends_with(&OSC7_INTRO[..k]))
        .unwrap_or(0)
}

/// Decode the path out of a `file://` URI, dropping the host part.
pub fn parse_file_uri(payload: &str) -> Option<String> {
    if payload.len() > MAX_URI_BYTES {
        return None;
    }
    let rest = payload.strip_prefix("file://")?;
    let path_start = rest.find('/')?;
    let raw = &rest[path_start..];
    let decoded = urlencoding::decode_binary(raw.as_bytes());
    let mut path = String::from_utf8_lossy(&decoded).into_owned();

    // `/C:/Users/...` is how Windows paths arrive; the leading slash is not part of them.
    let b = path.as_bytes();
    if b.len() >= 3 && b[0] == b'/' && b[1].is_ascii_alphabetic() && b[2] == b':' {
        path.remove(0);
    }

    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

#[derive(Debug, Default)]
pub struct CwdTracker {
    pending: String,
}

impl CwdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Scan one output chunk. Returns the last directory completed in it.
    pub fn feed(&mut self, chunk: &str) -> Option<String> {
        let joined;
        let text: &str = if self.pending.is_empty() {
            chunk
        } else {
            let mut carry = std::mem::take(&mut self.pending);
            carry.push_str(chunk);
            joined = carry;
            &joined
        };

        let mut found = None;
        let mut cursor = 0usize;
        loop {
            let rest = &text[cursor..];
            let Some(start) = rest.find(OSC7_INTRO) else {
                let keep = partial_intro_suffix(rest);
                if keep > 0 {
                    self.pending = rest[rest.len() - keep..].to_string();
                }
                break;
            };

            let seq_start = cursor + start;
            let body_start = seq_start + OSC7_INTRO.len();
            match find_terminator(&text[body_start..]) {
                Terminator::Found { end, len } => {
                    if let Some(path) = parse_file_uri(&text[body_start..body_start + end]) {
                        found = Some(path);
                    }
                    cursor = body_start + end + len;
                }
                Terminator::Abandoned { at } => {
                    cursor = body_start + at;
                }
                Terminator::Incomplete => {
                    let partial = &text[seq_start..];
                    if partial.len() <= MAX_PENDING_BYTES {
                        self.pending = partial.to_string();
                    } else {
                        tracing::debug!(len = partial.len(), "dropping oversized OSC 7 remainder");
                    }
                    break;
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_bel_terminated() {
        let mut t = CwdTracker::new();
        let out = t.feed("prompt\u{1b}]7;file://host/home/user\u{7}$ ");
        assert_eq!(out.as_deref(), Some("/home/user"));
        assert_eq!(t.pending_len(), 0);
    }

    #[test]
    fn st_terminated_and_percent_decoded() {
        let mut t = CwdTracker::new();
        let out = t.feed("\u{1b}]7;file:///tmp/with%20space\u{1b}\\");
        assert_eq!(out.as_deref(), Some("/tmp/with space"));
    }

    #[test]
    fn sequence_split_across_chunks() {
        let mut t = CwdTracker::new();
        assert_eq!(t.feed("output \u{1b}]7;file://box/home/us"), None);
        assert!(t.pending_len() > 0);
        assert_eq!(t.feed("er/project\u{7}more").as_deref(), Some("/home/user/project"));
        assert_eq!(t.pending_len(), 0);
    }

    #[test]
    fn introducer_split_across_chunks() {
        let mut t = CwdTracker::new();
        assert_eq!(t.feed("abc\u{1b}]"), None);
        assert_eq!(t.feed("7;file:///srv\u{7}").as_deref(), Some("/srv"));
    }

    #[test]
    fn st_split_between_escape_and_backslash() {
        let mut t = CwdTracker::new();
        assert_eq!(t.feed("\u{1b}]7;file:///var/log\u{1b}"), None);
        assert_eq!(t.feed("\\").as_deref(), Some("/var/log"));
    }

    #[test]
    fn last_sequence_in_chunk_wins() {
        let mut t = CwdTracker::new();
        let out = t.feed("\u{1b}]7;file:///a\u{7}x\u{1b}]7;file:///b\u{7}");
        assert_eq!(out.as_deref(), Some("/b"));
    }

    #[test]
    fn never_terminated_sequence_is_capped() {
        let mut t = CwdTracker::new();
        let mut chunk = String::from("\u{1b}]7;file:///");
        chunk.push_str(&"x".repeat(MAX_PENDING_BYTES));
        assert_eq!(t.feed(&chunk), None);
        assert_eq!(t.pending_len(), 0);
        // Scanning still works afterwards.
        assert_eq!(t.feed("\u{1b}]7;file:///ok\u{7}").as_deref(), Some("/ok"));
    }

    #[test]
    fn interrupted_sequence_is_abandoned() {
        let mut t = CwdTracker::new();
        let out = t.feed("\u{1b}]7;file:///broken\u{1b}[0m\u{1b}]7;file:///fine\u{7}");
        assert_eq!(out.as_deref(), Some("/fine"));
    }

    #[test]
    fn windows_drive_slash_is_stripped() {
        assert_eq!(parse_file_uri("file:///C:/Users/me").as_deref(), Some("C:/Users/me"));
        assert_eq!(parse_file_uri("file://host/d:/work").as_deref(), Some("d:/work"));
    }

    #[test]
    fn rejects_non_file_uris() {
        assert_eq!(parse_file_uri("http://host/x"), None);
        assert_eq!(parse_file_uri("file://hostonly"), None);
    }

    #[test]
    fn other_osc_sequences_are_ignored() {
        let mut t = CwdTracker::new();
        assert_eq!(t.feed("\u{1b}]0;title\u{7}\u{1b}]1337;CurrentDir=/x\u{7}"), None);
        assert_eq!(t.pending_len(), 0);
    }
}
