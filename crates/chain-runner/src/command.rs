use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Marker,
    Plain(Option<String>),
    Quoted(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    section: Option<&'static str>,
    flag: &'static str,
    value: Value,
}

impl Entry {
    fn is_present(&self) -> bool {
        match &self.value {
            Value::Marker => true,
            Value::Plain(v) | Value::Quoted(v) => v.is_some(),
        }
    }
}

/// Ordered list of (flag, optional value) entries for one sampler
/// invocation. Entries render in the order they were appended and absent
/// values render as nothing at all.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: PathBuf,
    entries: Vec<Entry>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            entries: Vec::new(),
        }
    }

    /// A bare token that is always emitted, e.g. `method=sample`.
    pub fn marker(mut self, token: &'static str) -> Self {
        self.entries.push(Entry {
            section: None,
            flag: token,
            value: Value::Marker,
        });
        self
    }

    pub fn marker_if(self, cond: bool, token: &'static str) -> Self {
        if cond {
            self.marker(token)
        } else {
            self
        }
    }

    /// `flag=value` when the value is set.
    pub fn pair<T: Display>(mut self, flag: &'static str, value: Option<T>) -> Self {
        self.entries.push(Entry {
            section: None,
            flag,
            value: Value::Plain(value.map(|v| v.to_string())),
        });
        self
    }

    /// `flag="value"` when the value is set. The quotes are display-only and
    /// never reach the spawned process.
    pub fn quoted_pair<T: Display>(mut self, flag: &'static str, value: Option<T>) -> Self {
        self.entries.push(Entry {
            section: None,
            flag,
            value: Value::Quoted(value.map(|v| v.to_string())),
        });
        self
    }

    /// `section flag=value` when the value is set, e.g. `random seed=42`.
    pub fn nested<T: Display>(
        mut self,
        section: &'static str,
        flag: &'static str,
        value: Option<T>,
    ) -> Self {
        self.entries.push(Entry {
            section: Some(section),
            flag,
            value: Value::Plain(value.map(|v| v.to_string())),
        });
        self
    }

    pub fn build(self) -> ChainCommand {
        let mut tokens = Vec::new();
        for entry in self.entries.iter().filter(|e| e.is_present()) {
            if let Some(section) = entry.section {
                tokens.push(Token::plain(section));
            }
            match &entry.value {
                Value::Marker => tokens.push(Token::plain(entry.flag)),
                Value::Plain(Some(v)) => tokens.push(Token::plain(format!("{}={}", entry.flag, v))),
                Value::Quoted(Some(v)) => tokens.push(Token {
                    display: format!("{}=\"{}\"", entry.flag, v),
                    arg: format!("{}={}", entry.flag, v),
                }),
                Value::Plain(None) | Value::Quoted(None) => {}
            }
        }
        ChainCommand {
            program: self.program,
            tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    display: String,
    arg: String,
}

impl Token {
    fn plain(s: impl Into<String>) -> Self {
        let s = s.into();
        Self {
            display: s.clone(),
            arg: s,
        }
    }
}

/// A fully rendered invocation for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCommand {
    program: PathBuf,
    tokens: Vec<Token>,
}

impl ChainCommand {
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments exactly as handed to the OS, program excluded.
    pub fn argv(&self) -> Vec<String> {
        self.tokens.iter().map(|t| t.arg.clone()).collect()
    }

    pub fn to_process(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.tokens.iter().map(|t| &t.arg));
        cmd
    }
}

impl Display for ChainCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for token in &self.tokens {
            write!(f, " {}", token.display)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_values_render_nothing() {
        let cmd = CommandBuilder::new("/bin/model")
            .pair("id", Some(3))
            .nested("random", "seed", None::<u32>)
            .pair("refresh", None::<u32>)
            .marker("method=sample")
            .marker_if(false, "save_warmup=1")
            .build();
        assert_eq!(cmd.to_string(), "/bin/model id=3 method=sample");
        assert_eq!(cmd.argv(), vec!["id=3", "method=sample"]);
    }

    #[test]
    fn nested_and_quoted_entries_split_into_argv_tokens() {
        let cmd = CommandBuilder::new("/bin/model")
            .nested("data", "file", Some("/d/x y.json"))
            .quoted_pair("metric_file", Some("/d/metric.json"))
            .build();
        assert_eq!(
            cmd.to_string(),
            "/bin/model data file=/d/x y.json metric_file=\"/d/metric.json\""
        );
        assert_eq!(
            cmd.argv(),
            vec!["data", "file=/d/x y.json", "metric_file=/d/metric.json"]
        );
        assert_eq!(cmd.program(), Path::new("/bin/model"));
    }
}
