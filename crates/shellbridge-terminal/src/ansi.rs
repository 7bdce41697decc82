//! Byte classifier and ANSI trimmer.
//!
//! Pure functions over a byte buffer with a cursor pointing at `0x1B`. No
//! state outside the call: an undecidable tail is reported back to the
//! caller, which is responsible for carrying it into the next call.

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

/// Outcome of trying to classify one escape run starting at `d[i]` (`d[i] == ESC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgrOsc {
    /// Recognized; the run spans `d[i..end]`.
    Yes { end: usize },
    /// Definitively not SGR/OSC/bracketed-paste.
    No,
    /// Not enough bytes yet to decide; caller must wait for more input.
    NeedMore,
}

/// Classify the escape sequence beginning at index `i` in `d`.
///
/// Recognizes: CSI `...m` (SGR), CSI `?2004h`/`?2004l` (bracketed paste),
/// OSC `P` + 7 bytes (set palette), OSC `R` (reset palette), and any other
/// OSC terminated by BEL or ST (`ESC \`).
pub fn check_sgr_osc(d: &[u8], i: usize) -> SgrOsc {
    let Some(&kind) = d.get(i + 1) else {
        return SgrOsc::NeedMore;
    };

    match kind {
        b'[' => check_csi(d, i),
        b']' => check_osc(d, i),
        _ => SgrOsc::No,
    }
}

fn check_csi(d: &[u8], i: usize) -> SgrOsc {
    // Bracketed paste mode: CSI ? 2 0 0 4 (h|l). Matched byte-by-byte so a
    // short buffer only reports NeedMore when everything seen so far still
    // agrees with the pattern.
    const PASTE_PREFIX: &[u8] = b"?2004";
    let mut paste_candidate = true;
    for (offset, &want) in PASTE_PREFIX.iter().enumerate() {
        match d.get(i + 2 + offset) {
            Some(&got) if got == want => continue,
            Some(_) => {
                paste_candidate = false;
                break;
            }
            None => return SgrOsc::NeedMore,
        }
    }
    if paste_candidate {
        match d.get(i + 7) {
            Some(b'h') | Some(b'l') => return SgrOsc::Yes { end: i + 8 },
            Some(_) => {}
            None => return SgrOsc::NeedMore,
        }
    }

    let mut j = i + 2;
    loop {
        let Some(&b) = d.get(j) else {
            return SgrOsc::NeedMore;
        };
        if b == b'm' {
            return SgrOsc::Yes { end: j + 1 };
        } else if b == b';' || b.is_ascii_digit() {
            j += 1;
            continue;
        } else {
            return SgrOsc::No;
        }
    }
}

fn check_osc(d: &[u8], i: usize) -> SgrOsc {
    let Some(&sub) = d.get(i + 2) else {
        return SgrOsc::NeedMore;
    };

    if sub == b'P' {
        // set palette: OSC P + 7 fixed bytes
        return if d.get(i + 8).is_some() {
            SgrOsc::Yes { end: i + 9 }
        } else {
            SgrOsc::NeedMore
        };
    }
    if sub == b'R' {
        return SgrOsc::Yes { end: i + 3 };
    }

    let mut j = i + 3;
    loop {
        let Some(&b) = d.get(j) else {
            return SgrOsc::NeedMore;
        };
        if b == BEL {
            return SgrOsc::Yes { end: j + 1 };
        }
        if b == ESC {
            let Some(&next) = d.get(j + 1) else {
                return SgrOsc::NeedMore;
            };
            if next == b'\\' {
                return SgrOsc::Yes { end: j + 2 };
            }
        }
        j += 1;
    }
}

/// Remove every recognized SGR/OSC run from `data`, returning the trimmed copy.
///
/// `strict`: when true, every escape encountered is asserted to be a
/// recognized SGR/OSC run (panics otherwise) — used in `EXEC_DIRECT` mode
/// after the caller has already confirmed promotion didn't trigger.
/// When false, unrecognized or undecidable escapes are left untouched
/// (best-effort trim, used for prompt text).
pub fn trim_sgr_osc(data: &[u8], strict: bool) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut search_from = 0usize;

    loop {
        let Some(rel) = out[search_from..].iter().position(|&b| b == ESC) else {
            break;
        };
        let idx = search_from + rel;

        match check_sgr_osc(&out, idx) {
            SgrOsc::Yes { end } => {
                out.drain(idx..end);
                search_from = idx;
            }
            SgrOsc::No => {
                if strict {
                    panic!("trim_sgr_osc: strict mode encountered a non-SGR/OSC escape");
                }
                search_from = idx + 1;
            }
            SgrOsc::NeedMore => {
                if strict {
                    panic!("trim_sgr_osc: strict mode encountered an undecidable escape tail");
                }
                break;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_sgr() {
        let d = b"\x1b[31mhello";
        assert_eq!(check_sgr_osc(d, 0), SgrOsc::Yes { end: 5 });
    }

    #[test]
    fn recognizes_plain_sgr_reset() {
        let d = b"\x1b[0m";
        assert_eq!(check_sgr_osc(d, 0), SgrOsc::Yes { end: 4 });
    }

    #[test]
    fn recognizes_bracketed_paste() {
        let on = b"\x1b[?2004h";
        assert_eq!(check_sgr_osc(on, 0), SgrOsc::Yes { end: 8 });
        let off = b"\x1b[?2004l";
        assert_eq!(check_sgr_osc(off, 0), SgrOsc::Yes { end: 8 });
    }

    #[test]
    fn rejects_cursor_motion() {
        let d = b"\x1b[2J";
        assert_eq!(check_sgr_osc(d, 0), SgrOsc::No);
    }

    #[test]
    fn reports_need_more_on_truncated_sgr() {
        let d = b"\x1b[31";
        assert_eq!(check_sgr_osc(d, 0), SgrOsc::NeedMore);
    }

    #[test]
    fn recognizes_osc_bel_terminated() {
        let d = b"\x1b]0;title\x07rest";
        assert_eq!(check_sgr_osc(d, 0), SgrOsc::Yes { end: 10 });
    }

    #[test]
    fn recognizes_osc_st_terminated() {
        let d = b"\x1b]0;title\x1b\\rest";
        assert_eq!(check_sgr_osc(d, 0), SgrOsc::Yes { end: 11 });
    }

    #[test]
    fn recognizes_set_and_reset_palette() {
        let set = b"\x1b]P0112233";
        assert_eq!(check_sgr_osc(set, 0), SgrOsc::Yes { end: 9 });
        let reset = b"\x1b]Rrest";
        assert_eq!(check_sgr_osc(reset, 0), SgrOsc::Yes { end: 3 });
    }

    #[test]
    fn trims_multiple_runs_lenient() {
        let d = b"\x1b[31mhello\x1b[0m world";
        let out = trim_sgr_osc(d, false);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn trim_strict_accepts_only_recognized_runs() {
        let d = b"\x1b[1mbold\x1b[0m";
        let out = trim_sgr_osc(d, true);
        assert_eq!(out, b"bold");
    }

    #[test]
    fn trim_lenient_leaves_unrecognized_escapes() {
        let d = b"\x1b[2Jcleared";
        let out = trim_sgr_osc(d, false);
        assert_eq!(out, b"\x1b[2Jcleared");
    }
}
