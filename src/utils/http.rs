use bytes::Bytes;
use futures_util::StreamExt;

pub(crate) const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
pub(crate) const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024 * 1024;

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let (bytes, truncated) = response_bytes_truncated(response, max_bytes).await;
    truncated_text(&bytes, truncated)
}

pub(crate) fn truncated_text(bytes: &[u8], truncated: bool) -> String {
    let mut body = String::from_utf8_lossy(bytes).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Reads at most `max_bytes` of the body; the flag reports whether more was left.
pub(crate) async fn response_bytes_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> (Bytes, bool) {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }
    (Bytes::from(out), truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_text_marks_cut_bodies() {
        assert_eq!(truncated_text(b"abc", false), "abc");
        assert_eq!(truncated_text(b"abc", true), "abc\n...(truncated)");
        assert_eq!(truncated_text(b"", true), "...(truncated)");
    }
}
