//! Terminal snapshot renderer: a fixed 80x24 vt100 emulator fed the raw PTY
//! byte stream during execution, used to render `DISPLAY` messages once a
//! session is promoted to `EXEC_TERMEMU`.

use shellbridge_core::config::{SNAPSHOT_COLS, SNAPSHOT_ROWS};

pub struct Snapshot {
    parser: vt100::Parser,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            parser: vt100::Parser::new(SNAPSHOT_ROWS, SNAPSHOT_COLS, 0),
        }
    }

    /// Feed raw PTY bytes. Must be called with *every* byte the classifier
    /// sees during execution, even bytes the output state machine drops,
    /// so the snapshot is complete if promotion happens later.
    pub fn feed(&mut self, data: &[u8]) {
        self.parser.process(data);
    }

    pub fn cursor(&self) -> (u16, u16) {
        let screen = self.parser.screen();
        let (row, col) = screen.cursor_position();
        (col, row)
    }

    /// 24 rows, each right-trimmed of trailing spaces.
    pub fn rows(&self) -> Vec<String> {
        let screen = self.parser.screen();
        (0..SNAPSHOT_ROWS)
            .map(|row| {
                let mut line = String::new();
                for col in 0..SNAPSHOT_COLS {
                    if let Some(cell) = screen.cell(row, col) {
                        line.push_str(cell.contents().as_str());
                        if cell.contents().is_empty() {
                            line.push(' ');
                        }
                    } else {
                        line.push(' ');
                    }
                }
                line.trim_end().to_string()
            })
            .collect()
    }

    /// Render the `DISPLAY` payload: a cursor-column header line followed by
    /// each row, prefixed with `-` on the cursor's row and ` ` elsewhere.
    pub fn render(&self) -> String {
        let (cursor_x, cursor_y) = self.cursor();
        let mut out = String::new();
        out.push_str(&" ".repeat(cursor_x as usize + 1));
        out.push_str("|\n");

        for (i, row) in self.rows().into_iter().enumerate() {
            out.push(if i as u16 == cursor_y { '-' } else { ' ' });
            out.push_str(&row);
            out.push('\n');
        }

        out
    }

    /// Bytes the emulator itself generated in reply to the shell (e.g. a
    /// cursor-position report answering DSR) that must be written back to
    /// the PTY master. This is the only path by which the emulator produces
    /// input to the shell.
    pub fn take_replies(&mut self) -> Vec<u8> {
        // vt100's Parser doesn't emit replies on its own, but some shell
        // programs poll cursor position via DSR (ESC[6n) outside of what
        // the parser tracks; the session event loop answers those directly
        // using `cursor()` — see session::handle_pty_reply_queries.
        Vec::new()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// DSR cursor-position query: `ESC[6n`. When seen in raw PTY bytes, the
/// caller should write back `cursor_position_reply`.
pub fn contains_cursor_position_query(bytes: &[u8]) -> bool {
    bytes.windows(4).any(|w| w == b"\x1b[6n")
}

pub fn cursor_position_reply(cursor_x: u16, cursor_y: u16) -> Vec<u8> {
    format!("\x1b[{};{}R", cursor_y + 1, cursor_x + 1).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_snapshot_has_cursor_at_origin() {
        let snap = Snapshot::new();
        assert_eq!(snap.cursor(), (0, 0));
    }

    #[test]
    fn feeding_text_advances_cursor() {
        let mut snap = Snapshot::new();
        snap.feed(b"hello");
        assert_eq!(snap.cursor(), (5, 0));
        assert_eq!(snap.rows()[0], "hello");
    }

    #[test]
    fn render_marks_cursor_row_and_column() {
        let mut snap = Snapshot::new();
        snap.feed(b"ab");
        let rendered = snap.render();
        let mut lines = rendered.lines();
        assert_eq!(lines.next().unwrap(), "   |");
        assert_eq!(lines.next().unwrap(), "-ab");
    }

    #[test]
    fn detects_cursor_position_query() {
        assert!(contains_cursor_position_query(b"foo\x1b[6nbar"));
        assert!(!contains_cursor_position_query(b"foo bar"));
    }

    #[test]
    fn cursor_position_reply_is_one_indexed() {
        assert_eq!(cursor_position_reply(0, 0), b"\x1b[1;1R");
        assert_eq!(cursor_position_reply(9, 4), b"\x1b[5;10R");
    }
}
