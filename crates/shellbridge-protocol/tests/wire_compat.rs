use shellbridge_protocol::control::{decode_response, input_command, signal_command, ControlResponse};
use shellbridge_protocol::wire::{ClientMessage, ServerMessage};

#[test]
fn init_line_round_trips_through_json() {
    let line = r#"{"type":"INIT","idname":"alice9","reinit":true}"#;
    let msg: ClientMessage = serde_json::from_str(line).unwrap();
    match msg {
        ClientMessage::Init { idname, reinit } => {
            assert_eq!(idname, "alice9");
            assert!(reinit);
        }
        _ => panic!("expected Init"),
    }
}

#[test]
fn server_messages_serialize_to_exact_wire_shape() {
    let prompt = ServerMessage::Prompt {
        payload: "$ ".to_string(),
    };
    assert_eq!(prompt.to_line(), "{\"type\":\"PROMPT\",\"payload\":\"$ \"}\n");

    let display = ServerMessage::Display {
        payload: " |\nfoo\n".to_string(),
    };
    assert_eq!(
        display.to_line(),
        "{\"type\":\"DISPLAY\",\"payload\":\" |\\nfoo\\n\"}\n"
    );
}

#[test]
fn control_commands_carry_through_decode_on_shell_side() {
    // The engine encodes an input command; nothing on the engine side decodes
    // it (only the in-sandbox shell does), so this just locks the wire shape.
    let pkt = input_command("ls -la\n");
    assert_eq!(pkt[0], 0x01);
    assert_eq!(&pkt[1..], b"ls -la\n");

    let sig = signal_command(19); // SIGSTOP on Linux, arbitrary here
    assert_eq!(sig.len(), 5);
    assert_eq!(i32::from_le_bytes(sig[1..5].try_into().unwrap()), 19);
}

#[test]
fn decodes_responses_the_shell_would_send() {
    let mut begin_packet = vec![0x02u8];
    assert_eq!(decode_response(&begin_packet).unwrap(), ControlResponse::Begin);

    begin_packet[0] = 0x01;
    begin_packet.extend_from_slice(b"user@host:~$ ");
    assert_eq!(
        decode_response(&begin_packet).unwrap(),
        ControlResponse::Prompt(b"user@host:~$ ".to_vec())
    );
}
