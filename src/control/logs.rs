// Bounded log retrieval: journalctl and plain files

use crate::control::models::{tail_str, LogTail};
use crate::control::runner::CommandRunner;
use crate::error::Result;
use anyhow::Context;
use futures::future::BoxFuture;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Retrieves recent log lines for a unit
#[cfg_attr(test, mockall::automock)]
pub trait LogSource: Send + Sync {
    /// Fetch up to `max_lines` of the newest log lines. Sources may return more;
    /// the caller applies the final bound.
    fn fetch(&self, unit: &str, max_lines: usize) -> BoxFuture<'static, Result<String>>;
}

/// Reads a unit's logs from the systemd journal
pub struct JournalLogSource {
    runner: Arc<dyn CommandRunner>,
    /// journalctl `--output` mode; journalctl's default when unset
    output: Option<String>,
}

impl JournalLogSource {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            output: None,
        }
    }

    pub fn with_output(mut self, output: Option<String>) -> Self {
        self.output = output;
        self
    }

    /// journalctl invocation for the newest `max_lines` entries of `unit`
    pub fn journalctl_args(unit: &str, max_lines: usize, output: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "journalctl".to_string(),
            "-u".to_string(),
            unit.to_string(),
            "-n".to_string(),
            max_lines.to_string(),
        ];
        if let Some(mode) = output {
            args.push(format!("--output={}", mode));
        }
        args.push("--no-pager".to_string());
        args
    }
}

impl LogSource for JournalLogSource {
    fn fetch(&self, unit: &str, max_lines: usize) -> BoxFuture<'static, Result<String>> {
        let runner = self.runner.clone();
        let argv = Self::journalctl_args(unit, max_lines, self.output.as_deref());

        Box::pin(async move {
            // Dropping the handle kills journalctl if the caller gives up
            let mut command = runner.spawn(&argv).context("Failed to start journalctl")?;
            let output = command.wait().await.context("journalctl did not complete")?;

            if !output.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!(
                    "journalctl exited with code {}: {}",
                    output.exit_code,
                    stderr.trim()
                );
            }

            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }
}

/// Reads the end of a plain log file, such as a game server console log
#[derive(Debug, Clone)]
pub struct FileLogSource {
    path: PathBuf,
    /// Bytes read from the end of the file
    window: u64,
}

impl FileLogSource {
    pub fn new(path: PathBuf, window: u64) -> Self {
        Self { path, window }
    }
}

impl LogSource for FileLogSource {
    fn fetch(&self, _unit: &str, max_lines: usize) -> BoxFuture<'static, Result<String>> {
        let path = self.path.clone();
        let window = self.window;

        Box::pin(async move {
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let len = file.metadata().await?.len();
            let offset = len.saturating_sub(window);
            file.seek(SeekFrom::Start(offset)).await?;

            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).await?;
            let raw = String::from_utf8_lossy(&bytes);

            // A mid-file window starts with a partial line
            let text: &str = if offset > 0 {
                raw.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
            } else {
                raw.as_ref()
            };

            let start = nth_line_from_end(text, max_lines).unwrap_or(0);
            Ok(text[start..].to_string())
        })
    }
}

/// Byte offset where the last `n` lines of `text` begin, if it has more than `n`
fn nth_line_from_end(text: &str, n: usize) -> Option<usize> {
    let body = text.strip_suffix('\n').unwrap_or(text);
    body.rmatch_indices('\n').nth(n.checked_sub(1)?).map(|(i, _)| i + 1)
}

/// Bound `text` to its last `max_lines` lines and newest `max_bytes` bytes.
/// Text inside the bounds is returned verbatim.
pub fn bound_tail(text: &str, max_lines: usize, max_bytes: usize) -> LogTail {
    let mut truncated = false;
    let mut tail = text;

    if let Some(start) = nth_line_from_end(tail, max_lines) {
        tail = &tail[start..];
        truncated = true;
    }
    if tail.len() > max_bytes {
        tail = tail_str(tail, max_bytes);
        truncated = true;
    }

    LogTail {
        lines: tail.lines().count(),
        text: tail.to_string(),
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::test_support::{Script, ScriptedRunner};
    use std::io::Write;

    fn numbered(count: usize) -> String {
        (0..count).map(|i| format!("line {}\n", i)).collect()
    }

    #[test]
    fn test_bound_tail_by_lines() {
        let tail = bound_tail(&numbered(200), 50, usize::MAX);
        assert_eq!(tail.lines, 50);
        assert!(tail.truncated);
        assert!(tail.text.starts_with("line 150\n"));
        assert!(tail.text.ends_with("line 199\n"));
    }

    #[test]
    fn test_bound_tail_within_limits() {
        let text = numbered(10);
        let tail = bound_tail(&text, 50, 1024);
        assert_eq!(tail.lines, 10);
        assert!(!tail.truncated);
        assert_eq!(tail.text, text);
    }

    #[test]
    fn test_bound_tail_exact_line_count_not_truncated() {
        let tail = bound_tail(&numbered(50), 50, usize::MAX);
        assert_eq!(tail.lines, 50);
        assert!(!tail.truncated);
    }

    #[test]
    fn test_bound_tail_without_trailing_newline() {
        let tail = bound_tail("a\nb\nc", 2, usize::MAX);
        assert_eq!(tail.text, "b\nc");
        assert!(tail.truncated);
    }

    #[test]
    fn test_bound_tail_by_bytes_respects_utf8() {
        // "é" is two bytes; a 3 byte ceiling must not split it
        let tail = bound_tail("xééé", 10, 3);
        assert_eq!(tail.text, "é");
        assert!(tail.truncated);
    }

    #[test]
    fn test_bound_tail_keeps_ansi_verbatim() {
        let text = "\x1b[31mred\x1b[0m\n";
        let tail = bound_tail(text, 5, 1024);
        assert_eq!(tail.text, text);
    }

    #[test]
    fn test_journalctl_args() {
        let args = JournalLogSource::journalctl_args("zomboid.service", 51, None);
        assert_eq!(
            args,
            ["journalctl", "-u", "zomboid.service", "-n", "51", "--no-pager"]
        );
    }

    #[test]
    fn test_journalctl_args_with_output_mode() {
        let args = JournalLogSource::journalctl_args("zomboid.service", 51, Some("short-precise"));
        assert!(args.contains(&"--output=short-precise".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--no-pager"));
    }

    #[tokio::test]
    async fn test_file_source_returns_newest_lines() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(numbered(100).as_bytes())?;

        let source = FileLogSource::new(file.path().to_path_buf(), 64 * 1024);
        let text = source.fetch("game", 5).await?;
        assert_eq!(text, "line 95\nline 96\nline 97\nline 98\nline 99\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_file_source_drops_partial_first_line() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"first line\nsecond\nthird\n")?;

        let source = FileLogSource::new(file.path().to_path_buf(), 16);
        let text = source.fetch("game", 10).await?;
        assert_eq!(text, "second\nthird\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let source = FileLogSource::new("/nonexistent/console.txt".into(), 1024);
        assert!(source.fetch("game", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_journal_source_returns_stdout() -> Result<()> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("journalctl", Script::exit(0).stdout("a\nb\n"));

        let source = JournalLogSource::new(runner.clone());
        let text = source.fetch("zomboid.service", 51).await?;
        assert_eq!(text, "a\nb\n");
        assert_eq!(
            runner.spawned()[0],
            JournalLogSource::journalctl_args("zomboid.service", 51, None)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_source_passes_output_mode() -> Result<()> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("journalctl", Script::exit(0).stdout("a\n"));

        let source =
            JournalLogSource::new(runner.clone()).with_output(Some("cat".to_string()));
        source.fetch("zomboid.service", 5).await?;
        assert!(runner.spawned()[0].contains(&"--output=cat".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_source_reports_command_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("journalctl", Script::exit(1).stderr("No journal files were found."));

        let source = JournalLogSource::new(runner);
        let err = source.fetch("zomboid.service", 10).await.unwrap_err();
        assert!(err.to_string().contains("No journal files"));
    }
}
