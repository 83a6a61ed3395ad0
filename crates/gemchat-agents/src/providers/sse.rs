use std::fmt::Display;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use gemchat_common::{Error, Result};

/// Turn an HTTP body of server-sent events into the payloads of its `data:`
/// lines. Lines may be split across chunks; `\r\n` endings are accepted and a
/// final line without a trailing newline is still delivered.
pub fn data_lines<S, E>(body: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let body = body.boxed();
    let state = (body, Vec::<u8>::new(), false);

    stream::try_unfold(state, |(mut body, mut buffer, mut finished)| async move {
        loop {
            if let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=i).collect();
                if let Some(data) = parse_data_line(&line) {
                    return Ok(Some((data, (body, buffer, finished))));
                }
                continue;
            }

            if finished {
                if buffer.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut buffer);
                if let Some(data) = parse_data_line(&line) {
                    return Ok(Some((data, (body, buffer, finished))));
                }
                return Ok(None);
            }

            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(Error::Stream(format!("network error: {e}"))),
                None => finished = true,
            }
        }
    })
    .boxed()
}

fn parse_data_line(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}
