//! FTP reply rendering (RFC 959 §4.2).
//!
//! Single-line replies are `NNN text\r\n`. Multi-line replies open every
//! line with `NNN-` and close with `NNN ` so clients can find the end of
//! the block.

/// One reply ready to be written to the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Reply {
        Reply { code, lines: vec![text.into()] }
    }

    pub fn multi(code: u16, lines: impl IntoIterator<Item = String>) -> Reply {
        let mut lines: Vec<String> = lines.into_iter().collect();
        if lines.is_empty() {
            lines.push(String::new());
        }
        Reply { code, lines }
    }

    /// Wire form, CRLF terminated.
    pub fn render(&self) -> String {
        if self.lines.len() == 1 {
            return format!("{} {}\r\n", self.code, self.lines[0]);
        }
        let mut out = String::new();
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            if i == last {
                out.push_str(&format!("{} {}\r\n", self.code, line));
            } else {
                out.push_str(&format!("{}-{}\r\n", self.code, line));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_form() {
        assert_eq!(Reply::new(230, "User logged in.").render(), "230 User logged in.\r\n");
    }

    #[test]
    fn multi_line_framing() {
        let reply = Reply::multi(211, vec![
            "Features:".to_string(),
            " MDTM".to_string(),
            "End".to_string(),
        ]);
        assert_eq!(reply.render(), "211-Features:\r\n211- MDTM\r\n211 End\r\n");
    }

    #[test]
    fn empty_multi_collapses_to_single() {
        assert_eq!(Reply::multi(200, Vec::new()).render(), "200 \r\n");
    }
}
