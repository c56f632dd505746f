use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// A writer that masks API keys before log lines reach stderr.
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: std::io::Write> std::io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let original = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&original);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::stderr()
    }
}

/// Replace OpenAI-style and Google API keys with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    static PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?x)
              sk-[A-Za-z0-9_\-]{20,}   # OpenAI-compatible keys
            | AIza[A-Za-z0-9_\-]{30,}  # Google API keys
            ",
        )
        .expect("redaction regex should compile")
    });

    PATTERNS.replace_all(input, "[REDACTED]").into_owned()
}

/// Install the global subscriber. `RUST_LOG` wins; otherwise `info`, or `debug` for
/// the ovocall crates when `verbose` is set.
pub fn init(verbose: bool) {
    let default = if verbose {
        "info,ovocall=debug,ovocall_agents=debug,ovocall_db=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr())
        .with_target(false)
        .init();
}
