//! Argument sink filled by [`crate::Command::prepare`].

use crate::error::{Error, Result};
use std::borrow::Cow;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Escaped when rendered.
    Arg(String),
    /// Rendered as-is, for operators and pre-quoted fragments.
    Verbatim(String),
}

/// Ordered argument list of one tool instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    tokens: Vec<Token>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, arg: impl Into<String>) -> &mut Self {
        self.tokens.push(Token::Arg(arg.into()));
        self
    }

    pub fn extend<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens
            .extend(args.into_iter().map(|arg| Token::Arg(arg.into())));
        self
    }

    pub fn push_path(&mut self, path: &Path) -> &mut Self {
        self.push(path.to_string_lossy().into_owned())
    }

    /// Append a fragment that is written to the tool without quoting.
    pub fn push_verbatim(&mut self, fragment: impl Into<String>) -> &mut Self {
        self.tokens.push(Token::Verbatim(fragment.into()));
        self
    }

    /// Attach a free-form message.
    ///
    /// Single-line text goes inline after `inline_flag`. Multi-line text cannot
    /// travel on the instruction line, so it is written to a temporary file
    /// passed after `file_flag`; the returned handle must be kept alive until
    /// the command has run.
    pub fn push_message(
        &mut self,
        inline_flag: &str,
        file_flag: &str,
        text: &str,
    ) -> Result<Option<NamedTempFile>> {
        if !text.contains(['\n', '\r']) {
            self.push(inline_flag).push(text);
            return Ok(None);
        }

        let mut file = NamedTempFile::new()
            .map_err(|e| Error::Prepare(format!("cannot create message file: {e}")))?;
        file.write_all(text.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| Error::Prepare(format!("cannot write message file: {e}")))?;
        self.push(file_flag).push_path(file.path());
        Ok(Some(file))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Raw argument values, without quoting.
    pub fn values(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .map(|token| match token {
                Token::Arg(s) | Token::Verbatim(s) => s.as_str(),
            })
            .collect()
    }

    /// Render the single instruction line written to the tool.
    pub fn to_command_line(&self) -> Result<String> {
        if self.tokens.is_empty() {
            return Err(Error::Prepare("command has no arguments".into()));
        }
        let mut line = String::new();
        for token in &self.tokens {
            let rendered = match token {
                Token::Arg(arg) => shell_escape::escape(Cow::Borrowed(arg.as_str())),
                Token::Verbatim(fragment) => Cow::Borrowed(fragment.as_str()),
            };
            if rendered.contains(['\n', '\r']) {
                return Err(Error::Prepare(
                    "argument contains a line break; attach it as a message file".into(),
                ));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&rendered);
        }
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_arguments() {
        let mut args = Arguments::new();
        args.push("echo").push("hi");
        assert_eq!(args.values(), vec!["echo", "hi"]);
        assert_eq!(args.to_command_line().unwrap(), "echo hi");
    }

    #[test]
    fn test_quoting() {
        let mut args = Arguments::new();
        args.push("checkout").push("my file.txt").push("it's");
        assert_eq!(
            args.to_command_line().unwrap(),
            r"checkout 'my file.txt' 'it'\''s'"
        );
    }

    #[test]
    fn test_verbatim_is_not_quoted() {
        let mut args = Arguments::new();
        args.push("echo").push("oops").push_verbatim(">&2");
        assert_eq!(args.to_command_line().unwrap(), "echo oops >&2");
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(
            Arguments::new().to_command_line(),
            Err(Error::Prepare(_))
        ));
    }

    #[test]
    fn test_line_break_is_rejected() {
        let mut args = Arguments::new();
        args.push_verbatim("echo a\necho b");
        assert!(matches!(args.to_command_line(), Err(Error::Prepare(_))));
    }

    #[test]
    fn test_single_line_message_inline() {
        let mut args = Arguments::new();
        args.push("checkout");
        let file = args.push_message("-c", "-cfile", "fix typo").unwrap();
        assert!(file.is_none());
        assert_eq!(args.values(), vec!["checkout", "-c", "fix typo"]);
    }

    #[test]
    fn test_multi_line_message_goes_to_file() {
        let mut args = Arguments::new();
        args.push("checkin");
        let file = args
            .push_message("-c", "-cfile", "first line\nsecond line")
            .unwrap()
            .expect("multi-line message should use a file");
        let values = args.values();
        assert_eq!(values[1], "-cfile");
        assert_eq!(values[2], file.path().to_string_lossy());
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "first line\nsecond line");
        assert!(!args.to_command_line().unwrap().contains('\n'));
    }
}
