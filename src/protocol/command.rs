//! Control-channel command parsing.
//!
//! A command line is the verb (case-insensitive) and everything after the
//! first run of whitespace as the raw argument. Decoding is lossy UTF-8;
//! invalid bytes have already been replaced by the channel reader.

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Uppercased verb.
    pub verb: String,
    /// Raw argument, outer whitespace trimmed; may be empty.
    pub arg: String,
}

impl CommandLine {
    pub fn parse(line: &str) -> CommandLine {
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => CommandLine {
                verb: verb.to_ascii_uppercase(),
                arg: rest.trim().to_string(),
            },
            None => CommandLine { verb: line.to_ascii_uppercase(), arg: String::new() },
        }
    }

    pub fn has_arg(&self) -> bool {
        !self.arg.is_empty()
    }

    /// Splits the argument into whitespace-separated words.
    pub fn arg_words(&self) -> Vec<&str> {
        self.arg.split_whitespace().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_is_uppercased_argument_preserved() {
        let cmd = CommandLine::parse("retr /Pub/File.BIN\r\n");
        assert_eq!(cmd.verb, "RETR");
        assert_eq!(cmd.arg, "/Pub/File.BIN");
    }

    #[test]
    fn bare_verb_has_empty_arg() {
        let cmd = CommandLine::parse("PASV\r\n");
        assert_eq!(cmd.verb, "PASV");
        assert!(!cmd.has_arg());
    }

    #[test]
    fn arguments_keep_inner_spaces() {
        let cmd = CommandLine::parse("SITE NUKE /MP3/Some-Rel bad dupe\r\n");
        assert_eq!(cmd.verb, "SITE");
        assert_eq!(cmd.arg, "NUKE /MP3/Some-Rel bad dupe");
        assert_eq!(cmd.arg_words(), vec!["NUKE", "/MP3/Some-Rel", "bad", "dupe"]);
    }
}
