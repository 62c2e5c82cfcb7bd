// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sink side of the `scp` copy protocol, as spoken to `scp -t <path>`.
//!
//! A single-file transfer is a control line `C<mode> <size> <name>\n`, the
//! raw file bytes, and a terminating NUL. The remote end replies with a NUL
//! byte for every accepted step, or with `\x01`/`\x02` followed by a message
//! on warnings and fatal errors.

/// Mode announced for every uploaded file.
pub const UPLOAD_FILE_MODE: &str = "0660";

// `scp -t` with an explicit target path ignores the announced name.
const ANNOUNCED_NAME: &str = "file";

/// Frames `content` as a single-file transfer.
pub fn encode_single_file(content: &[u8]) -> Vec<u8> {
    let header =
        format!("C{} {} {}\n", UPLOAD_FILE_MODE, content.len(), ANNOUNCED_NAME);
    let mut payload = Vec::with_capacity(header.len() + content.len() + 1);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(content);
    payload.push(0);
    payload
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("missing control line")]
    MissingHeader,
    #[error("malformed control line {0:?}")]
    MalformedHeader(String),
    #[error("expected {expected} bytes of content, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("missing terminating NUL")]
    MissingTerminator,
}

/// Inverse of [`encode_single_file`]: returns the file mode and content.
pub fn decode_single_file(payload: &[u8]) -> Result<(String, Vec<u8>), DecodeError> {
    let newline = payload
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(DecodeError::MissingHeader)?;
    let header = String::from_utf8_lossy(&payload[..newline]).into_owned();
    let mut fields = header.splitn(3, ' ');
    let (mode, size) = match (fields.next(), fields.next(), fields.next()) {
        (Some(mode), Some(size), Some(_name)) if mode.starts_with('C') => {
            let size = size
                .parse::<usize>()
                .map_err(|_| DecodeError::MalformedHeader(header.clone()))?;
            (mode[1..].to_string(), size)
        }
        _ => return Err(DecodeError::MalformedHeader(header)),
    };

    let body = &payload[newline + 1..];
    if body.len() < size {
        return Err(DecodeError::Truncated { expected: size, found: body.len() });
    }
    if body.get(size) != Some(&0) {
        return Err(DecodeError::MissingTerminator);
    }
    Ok((mode, body[..size].to_vec()))
}

/// Scans the acknowledgements `scp -t` wrote to its stdout and returns the
/// first error or warning message, if any.
pub fn find_rejection(acks: &[u8]) -> Option<String> {
    let start = acks.iter().position(|b| *b == 1 || *b == 2)?;
    let message = &acks[start + 1..];
    let end = message.iter().position(|b| *b == b'\n').unwrap_or(message.len());
    Some(String::from_utf8_lossy(&message[..end]).trim().to_string())
}
