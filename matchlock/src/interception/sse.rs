//! Server-Sent-Events body rewriting: literal `body_replacements` apply
//! only to the payload of each `data:` line, preserving line framing and
//! chunk boundaries.

/// Apply `replacements` to the payload portion of every `data:` line in
/// `chunk`. Lines that aren't `data:` lines (event, id, comment, blank)
/// pass through unchanged. `chunk` is assumed to be a sequence of
/// complete lines; callers buffer partial lines across TCP segments
/// before calling this.
pub fn rewrite_sse_chunk(chunk: &str, replacements: &[(String, String)]) -> String {
    let mut out = String::with_capacity(chunk.len());
    let mut rest = chunk;
    loop {
        let (line, remainder, had_newline) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..], true),
            None => (rest, "", false),
        };

        if let Some(payload) = line.strip_prefix("data:") {
            let mut rewritten = payload.to_string();
            for (find, replace) in replacements {
                rewritten = rewritten.replace(find.as_str(), replace.as_str());
            }
            out.push_str("data:");
            out.push_str(&rewritten);
        } else {
            out.push_str(line);
        }

        if had_newline {
            out.push('\n');
            rest = remainder;
        } else {
            break;
        }
        if rest.is_empty() {
            break;
        }
    }
    out
}

/// Buffers incoming bytes and yields complete lines as they become
/// available, so SSE rewriting can be applied to each full `data:` line
/// even when it arrives split across TCP reads.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub fn take_pending(&mut self) -> String {
        let remaining = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&remaining).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_only_data_lines() {
        let chunk = "event: message\ndata:{\"id\":0,\"x\":1}\n\n";
        let replacements = vec![("\"id\"".to_string(), "\"sid\"".to_string())];
        let rewritten = rewrite_sse_chunk(chunk, &replacements);
        assert_eq!(rewritten, "event: message\ndata:{\"sid\":0,\"x\":1}\n\n");
    }

    #[test]
    fn line_buffer_reassembles_split_lines() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"data:{\"id\":0");
        assert!(lines.is_empty());
        let lines = buf.push(b"}\n\n");
        assert_eq!(lines, vec!["data:{\"id\":0}\n".to_string(), "\n".to_string()]);
    }
}
