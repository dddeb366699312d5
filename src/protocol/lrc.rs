//! LRC-checksummed ASCII protocol of the Sierra mass-flow controllers.
//!
//! Request: `<?|!><Cmd><args><LRC>\r\n`, where LRC is the two's complement of
//! the 8-bit sum of the command characters, as two lowercase hex digits.
//! Reply: `<Cmd><value><LRC>\r\n`. The reply LRC is not verified.

use crate::adapters::Transport;
use crate::error::{to_hex, CtlResult, ProtocolError};
use tracing::debug;

/// Upper bound on reply length; a reply without a newline within this many
/// bytes is treated as no reply.
pub const MAX_REPLY: usize = 128;

/// Characters trailing the value: two LRC digits and CR LF.
const TRAILER: usize = 4;
/// Echoed command mnemonic at the start of a reply.
const ECHO: usize = 4;

/// Two's complement of the 8-bit character sum.
pub fn lrc(command: &str) -> u8 {
    let sum = command.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

/// Frame a command with its LRC and terminator.
pub fn encode_command(command: &str) -> Vec<u8> {
    format!("{command}{:02x}\r\n", lrc(command)).into_bytes()
}

/// Value carried by a reply line: the echoed mnemonic and the trailer removed.
pub fn reply_value(line: &[u8]) -> Result<String, ProtocolError> {
    let text = String::from_utf8_lossy(line);
    let body_end = text
        .len()
        .checked_sub(TRAILER)
        .ok_or_else(|| ProtocolError::malformed("reply shorter than trailer", line))?;
    let body = text
        .get(..body_end)
        .ok_or_else(|| ProtocolError::malformed("reply is not ASCII", line))?;
    Ok(body.get(ECHO..).unwrap_or_default().to_string())
}

/// Send a command and return the value of the reply line.
pub async fn query(port: &mut dyn Transport, command: &str) -> CtlResult<String> {
    port.write(&encode_command(command)).await?;

    let mut line = Vec::new();
    loop {
        let byte = port.read(1).await?;
        match byte.first() {
            Some(b) => {
                line.push(*b);
                if *b == b'\n' {
                    break;
                }
                if line.len() >= MAX_REPLY {
                    return Err(ProtocolError::malformed("reply without terminator", &line).into());
                }
            }
            None => return Err(ProtocolError::NoResponse { attempts: 1 }.into()),
        }
    }
    debug!(command, reply = %to_hex(&line), "LRC query");
    Ok(reply_value(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    #[test]
    fn test_lrc_is_twos_complement() {
        // '?'+'F'+'l'+'o'+'w' = 0x1d7 -> 0xd7 -> 0x29
        assert_eq!(lrc("?Flow"), 0x29);
        assert_eq!(lrc(""), 0);
        for cmd in ["!Setr25.0", "?Fscl", "?Gnam"] {
            let sum = cmd.bytes().fold(0u8, |a, b| a.wrapping_add(b));
            assert_eq!(sum.wrapping_add(lrc(cmd)), 0);
        }
    }

    #[test]
    fn test_encode_uses_two_hex_digits() {
        // Sum 0xFF gives LRC 0x01, rendered with a leading zero
        let cmd = "\u{7f}\u{7f}\u{1}";
        assert_eq!(lrc(cmd), 0x01);
        assert!(encode_command(cmd).ends_with(b"01\r\n"));
        assert_eq!(encode_command("?Flow"), b"?Flow29\r\n".to_vec());
    }

    #[test]
    fn test_reply_value() {
        assert_eq!(reply_value(b"Flow25.03ab\r\n").unwrap(), "25.03");
        assert_eq!(reply_value(b"Flow7f\r\n").unwrap(), "");
        assert!(reply_value(b"\r\n").is_err());
    }

    #[tokio::test]
    async fn test_query_reads_to_newline() {
        let mock = MockTransport::new("rs232-n2").with_responder(|w: &[u8]| {
            assert_eq!(w, b"?Fscl39\r\n");
            vec![b"Fscl50.00".to_vec(), b"00\r\n".to_vec()]
        });
        let mut port = mock.clone();
        assert_eq!(query(&mut port, "?Fscl").await.unwrap(), "50.00");
    }

    #[tokio::test]
    async fn test_silence_is_no_response() {
        let mut port = MockTransport::new("rs232-n2");
        let err = query(&mut port, "?Flow").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::CtlError::Protocol(ProtocolError::NoResponse { .. })
        ));
    }
}
