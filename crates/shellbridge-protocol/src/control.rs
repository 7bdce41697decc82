//! Control protocol: AF_UNIX SEQPACKET byte-tag wire format between the
//! engine and the in-sandbox shell. Framing (one packet per message) is
//! provided by SOCK_SEQPACKET itself; this module only handles tag bytes.

/// Outbound command tags (engine → shell).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandTag {
    Input = 0x01,
    Signal = 0x02,
}

/// Inbound response tags (shell → engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseTag {
    Prompt = 0x01,
    Begin = 0x02,
}

/// A decoded inbound control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Prompt(Vec<u8>),
    Begin,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ControlDecodeError {
    #[error("empty control packet")]
    Empty,
    #[error("unknown control response tag: 0x{0:02x}")]
    UnknownTag(u8),
}

/// Build the `CMD_INPUT` packet: tag byte followed by the UTF-8 line to inject.
pub fn input_command(line: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + line.len());
    buf.push(CommandTag::Input as u8);
    buf.extend_from_slice(line.as_bytes());
    buf
}

/// Build the `CMD_SIGNAL` packet: tag byte followed by a little-endian i32 signal number.
pub fn signal_command(signum: i32) -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0] = CommandTag::Signal as u8;
    buf[1..5].copy_from_slice(&signum.to_le_bytes());
    buf
}

/// Decode one inbound packet (tag byte + payload) from the shell.
pub fn decode_response(packet: &[u8]) -> Result<ControlResponse, ControlDecodeError> {
    let (tag, payload) = packet.split_first().ok_or(ControlDecodeError::Empty)?;
    match *tag {
        t if t == ResponseTag::Prompt as u8 => Ok(ControlResponse::Prompt(payload.to_vec())),
        t if t == ResponseTag::Begin as u8 => Ok(ControlResponse::Begin),
        other => Err(ControlDecodeError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_input_command() {
        let pkt = input_command("echo hi");
        assert_eq!(pkt[0], 0x01);
        assert_eq!(&pkt[1..], b"echo hi");
    }

    #[test]
    fn encodes_signal_command_little_endian() {
        let pkt = signal_command(20);
        assert_eq!(pkt[0], 0x02);
        assert_eq!(&pkt[1..], &20i32.to_le_bytes());
    }

    #[test]
    fn decodes_prompt_and_begin() {
        let prompt = decode_response(&[0x01, b'$', b' ']).unwrap();
        assert_eq!(prompt, ControlResponse::Prompt(vec![b'$', b' ']));

        let begin = decode_response(&[0x02]).unwrap();
        assert_eq!(begin, ControlResponse::Begin);
    }

    #[test]
    fn rejects_empty_and_unknown_tag() {
        assert_eq!(decode_response(&[]), Err(ControlDecodeError::Empty));
        assert_eq!(
            decode_response(&[0xff]),
            Err(ControlDecodeError::UnknownTag(0xff))
        );
    }
}
