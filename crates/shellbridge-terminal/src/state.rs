//! Output state machine and flush scheduler.
//!
//! Owns the session mode, the pending-output buffer, and the soft flush
//! deadline. `handle_ptm` is fed raw PTY bytes and the current flush
//! pressure; it returns zero or more outbound messages plus any bytes the
//! terminal emulator wants written back to the PTY (e.g. cursor-position
//! replies).

use std::time::{Duration, Instant};

use shellbridge_core::config::DIRECT_CHUNK_LIMIT;
use shellbridge_protocol::ServerMessage;

use crate::ansi::{check_sgr_osc, trim_sgr_osc, SgrOsc};
use crate::snapshot::{self, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Bad,
    Prompt,
    ExecDirect,
    ExecTermemu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    IfNecessary,
    HitTimer,
    Forced,
}

/// What a call to `handle_ptm` produced.
#[derive(Debug, Default)]
pub struct PtmOutcome {
    pub messages: Vec<ServerMessage>,
    /// Bytes to write back to the PTY master (terminal emulator replies).
    pub pty_replies: Vec<u8>,
}

pub struct Engine {
    mode: SessionMode,
    pending: Vec<u8>,
    snapshot: Option<Snapshot>,
    last_flush_ts: Instant,
    has_flush_wait: bool,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            mode: SessionMode::Bad,
            pending: Vec::new(),
            snapshot: None,
            last_flush_ts: Instant::now(),
            has_flush_wait: false,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn has_flush_wait(&self) -> bool {
        self.has_flush_wait
    }

    /// The soft deadline by which the next flush must happen, if any is pending.
    pub fn flush_deadline(&self, soft_deadline: Duration) -> Option<Instant> {
        self.has_flush_wait
            .then(|| self.last_flush_ts + soft_deadline)
    }

    /// `BEGIN` control response: enter EXEC_DIRECT, instantiate a fresh snapshot.
    pub fn on_begin(&mut self) {
        self.mode = SessionMode::ExecDirect;
        self.snapshot = Some(Snapshot::new());
    }

    /// `PROMPT` control response: drain, assert clean, enter PROMPT.
    ///
    /// Returns the drain outcome (normally empty) plus the `PROMPT` message itself.
    pub fn on_prompt(&mut self, raw_payload: &[u8]) -> PtmOutcome {
        let mut outcome = self.handle_ptm(&[], FlushType::Forced);
        debug_assert!(!self.has_flush_wait, "forced drain must clear flush_wait");

        self.mode = SessionMode::Prompt;
        self.snapshot = None;

        let cleaned = clean_prompt(raw_payload);
        outcome.messages.push(ServerMessage::Prompt {
            payload: String::from_utf8_lossy(&cleaned).into_owned(),
        });
        outcome
    }

    /// Core dispatch, called with raw PTY bytes (possibly empty, to force a drain).
    pub fn handle_ptm(&mut self, data: &[u8], flush_type: FlushType) -> PtmOutcome {
        let mut data: Vec<u8> = data.iter().copied().filter(|&b| b != 0).collect();

        let mut pty_replies = Vec::new();
        if !data.is_empty() {
            if let Some(snap) = self.snapshot.as_mut() {
                snap.feed(&data);
                if snapshot::contains_cursor_position_query(&data) {
                    let (x, y) = snap.cursor();
                    pty_replies.extend(snapshot::cursor_position_reply(x, y));
                }
            }
        }

        let mut outcome = PtmOutcome::default();
        outcome.pty_replies = pty_replies;
        let mut flush_wait = false;

        loop {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(&data);
            data.clear();

            match self.mode {
                SessionMode::Prompt | SessionMode::Bad => {
                    self.pending.clear();
                    break;
                }
                SessionMode::ExecDirect => {
                    let should_switch = detect_promotion(&mut buf, &mut self.pending);

                    if should_switch {
                        self.mode = SessionMode::ExecTermemu;
                        // buf is discarded; the snapshot already has every byte.
                        continue;
                    }

                    let mut buf = trim_sgr_osc(&buf, true);

                    while matches!(buf.last(), Some(b'\r')) {
                        let last = buf.pop().unwrap();
                        self.pending.insert(0, last);
                    }
                    buf = replace_crlf(&buf);

                    let mut has_pending_from_limit = false;
                    if !buf.is_empty() {
                        let mut should_flush = flush_type != FlushType::IfNecessary;

                        if buf.len() > DIRECT_CHUNK_LIMIT {
                            should_flush = true;
                            let remainder = buf.split_off(DIRECT_CHUNK_LIMIT);
                            prepend(&mut self.pending, &remainder);
                            has_pending_from_limit = true;
                        }

                        if flush_type != FlushType::Forced {
                            if let Some(nl) = buf.iter().rposition(|&b| b == b'\n') {
                                if nl != buf.len() - 1 {
                                    let tail = buf.split_off(nl + 1);
                                    prepend(&mut self.pending, &tail);
                                    flush_wait = true;
                                }
                            }
                        }

                        if should_flush {
                            outcome.messages.push(ServerMessage::Direct {
                                payload: String::from_utf8_lossy(&buf).into_owned(),
                            });
                            self.last_flush_ts = Instant::now();
                        } else {
                            prepend(&mut self.pending, &buf);
                            flush_wait = true;
                        }
                    }

                    if has_pending_from_limit {
                        continue;
                    }
                    break;
                }
                SessionMode::ExecTermemu => {
                    if flush_type != FlushType::IfNecessary {
                        if let Some(snap) = &self.snapshot {
                            outcome.messages.push(ServerMessage::Display {
                                payload: snap.render(),
                            });
                            self.last_flush_ts = Instant::now();
                        }
                    } else {
                        flush_wait = true;
                    }
                    break;
                }
            }
        }

        self.has_flush_wait = flush_wait;
        outcome
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn prepend(pending: &mut Vec<u8>, bytes: &[u8]) {
    let mut combined = bytes.to_vec();
    combined.extend_from_slice(pending);
    *pending = combined;
}

fn replace_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && data.get(i + 1) == Some(&b'\n') {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Detect whether `buf` contains a promotion trigger (erase char, or a
/// decidable non-SGR/OSC escape). On an undecidable trailing escape, the
/// buffer is truncated at that point and the tail pushed into `pending`.
fn detect_promotion(buf: &mut Vec<u8>, pending: &mut Vec<u8>) -> bool {
    if buf.contains(&0x08) || buf.contains(&0x7f) {
        return true;
    }

    let mut search_from = 0usize;
    loop {
        let Some(rel) = buf[search_from..].iter().position(|&b| b == 0x1b) else {
            return false;
        };
        let idx = search_from + rel;

        match check_sgr_osc(buf, idx) {
            SgrOsc::Yes { end } => {
                search_from = end;
            }
            SgrOsc::No => return true,
            SgrOsc::NeedMore => {
                let tail = buf.split_off(idx);
                prepend(pending, &tail);
                return false;
            }
        }
    }
}

/// Lenient ANSI strip for prompt text: trims recognized SGR/OSC runs, then a
/// best-effort regex covering common C1/CSI escapes (this does not fully
/// cover multi-byte OSC terminated by ST — kept intentionally, not a bug to
/// fix), then drops any surviving ESC/CR/BS/DEL bytes outright.
fn clean_prompt(raw: &[u8]) -> Vec<u8> {
    let trimmed = trim_sgr_osc(raw, false);

    let text = String::from_utf8_lossy(&trimmed);
    let re = ansi_strip_regex();
    let stripped = re.replace_all(&text, "");

    stripped
        .bytes()
        .filter(|&b| !matches!(b, 0x1b | b'\r' | 0x08 | 0x7f))
        .collect()
}

fn ansi_strip_regex() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?:\x1B[@-Z\\-_]|[\x80-\x9A\x9C-\x9F]|(?:\x1B\[|\x9B)[0-?]*[ -/]*[@-~])")
            .expect("static regex is valid")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(engine: &mut Engine, data: &[u8], ft: FlushType) -> Vec<String> {
        engine
            .handle_ptm(data, ft)
            .messages
            .into_iter()
            .map(|m| match m {
                ServerMessage::Direct { payload } => format!("DIRECT:{payload}"),
                ServerMessage::Display { payload } => format!("DISPLAY:{payload}"),
                ServerMessage::Prompt { payload } => format!("PROMPT:{payload}"),
                ServerMessage::Upload { .. } => "UPLOAD".to_string(),
            })
            .collect()
    }

    #[test]
    fn scenario_echo_hello_world() {
        let mut engine = Engine::new();
        engine.on_begin();
        let msgs = drive(&mut engine, b"hello world\n", FlushType::IfNecessary);
        // newline triggers flush_wait, tail pushed to pending, nothing flushed yet
        assert!(msgs.is_empty());
        let msgs = drive(&mut engine, b"", FlushType::HitTimer);
        assert_eq!(msgs, vec!["DIRECT:hello world\n".to_string()]);
    }

    #[test]
    fn forced_flush_emits_even_without_trailing_newline() {
        let mut engine = Engine::new();
        engine.on_begin();
        drive(&mut engine, b"partial", FlushType::IfNecessary);
        let msgs = drive(&mut engine, b"", FlushType::Forced);
        assert_eq!(msgs, vec!["DIRECT:partial".to_string()]);
    }

    #[test]
    fn strips_sgr_before_flush() {
        let mut engine = Engine::new();
        engine.on_begin();
        let msgs = drive(&mut engine, b"\x1b[31mred\x1b[0m\n", FlushType::HitTimer);
        assert_eq!(msgs, vec!["DIRECT:red\n".to_string()]);
    }

    #[test]
    fn promotes_to_termemu_on_erase_character() {
        let mut engine = Engine::new();
        engine.on_begin();
        let msgs = drive(&mut engine, b"abc\x08", FlushType::HitTimer);
        assert_eq!(engine.mode(), SessionMode::ExecTermemu);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].starts_with("DISPLAY:"));
    }

    #[test]
    fn caps_direct_payload_at_2000_chars() {
        let mut engine = Engine::new();
        engine.on_begin();
        let long = "a".repeat(2500);
        let msgs = drive(&mut engine, long.as_bytes(), FlushType::Forced);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], format!("DIRECT:{}", "a".repeat(2000)));
        assert_eq!(msgs[1], format!("DIRECT:{}", "a".repeat(500)));
    }

    #[test]
    fn on_prompt_strips_ansi_and_control_bytes() {
        let mut engine = Engine::new();
        engine.on_begin();
        let outcome = engine.on_prompt(b"\x1b[32muser@host\x1b[0m:~$ \r");
        assert_eq!(engine.mode(), SessionMode::Prompt);
        let ServerMessage::Prompt { payload } = outcome.messages.last().unwrap() else {
            panic!("expected prompt message");
        };
        assert_eq!(payload, "user@host:~$ ");
    }

    #[test]
    fn prompt_and_bad_modes_discard_everything() {
        let mut engine = Engine::new();
        let outcome = engine.handle_ptm(b"ignored", FlushType::Forced);
        assert!(outcome.messages.is_empty());
    }
}
