use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// A writer that scrubs API keys from log output before it reaches stderr.
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
        self.inner.write_all(redact_secrets(&original).as_bytes())?;
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

/// Replace Google API keys and `key=` query parameters with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    static KEY_PARAM: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"([?&]key=)[^&\s]+").expect("key param regex should compile")
    });
    static PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?x)
              AIza[0-9A-Za-z_\-]{20,}          # Google API keys
            | x-goog-api-key:\s*\S+            # header dumps
            ",
        )
        .expect("redaction regex should compile")
    });

    let scrubbed = KEY_PARAM.replace_all(input, "${1}[REDACTED]");
    PATTERNS.replace_all(&scrubbed, "[REDACTED]").into_owned()
}
