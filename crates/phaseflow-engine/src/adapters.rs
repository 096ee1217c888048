use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use phaseflow_core::catalog::CatalogQuestion;
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::{CommandOutput, CommandRunner, LlmClient, QuestionCatalog};

/// Output beyond this many bytes is cut off.
const MAX_OUTPUT_BYTES: usize = 30_000;

/// Runs system-command nodes through `bash -c` in a working directory.
pub struct ShellCommandRunner {
    working_dir: PathBuf,
    timeout_secs: u64,
}

impl ShellCommandRunner {
    pub fn new(working_dir: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout_secs,
        }
    }
}

impl CommandRunner for ShellCommandRunner {
    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            debug!(command = %command, dir = %self.working_dir.display(), "Executing command");

            let timeout = Duration::from_secs(self.timeout_secs);
            let result = tokio::time::timeout(timeout, async {
                tokio::process::Command::new("bash")
                    .arg("-c")
                    .arg(command)
                    .current_dir(&self.working_dir)
                    .kill_on_drop(true)
                    .output()
                    .await
            })
            .await;

            match result {
                Ok(Ok(output)) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let stderr = String::from_utf8_lossy(&output.stderr);

                    let mut content = String::new();
                    if !stdout.is_empty() {
                        content.push_str(&stdout);
                    }
                    if !stderr.is_empty() {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str("STDERR:\n");
                        content.push_str(&stderr);
                    }
                    truncate_output(&mut content);

                    if output.status.success() {
                        Ok(CommandOutput::success(content))
                    } else {
                        let code = output.status.code().unwrap_or(-1);
                        Ok(CommandOutput::failure(format!("Exit code {}\n{}", code, content)))
                    }
                }
                Ok(Err(e)) => Err(PhaseflowError::Command {
                    command: command.to_string(),
                    message: e.to_string(),
                }),
                Err(_) => Err(PhaseflowError::CommandTimeout {
                    command: command.to_string(),
                    timeout_secs: self.timeout_secs,
                }),
            }
        })
    }
}

/// Language model reached through an external command.
///
/// The prompt is written to the command's stdin and its stdout is the
/// completion. Tool names are passed in `PHASEFLOW_TOOLS`, comma-separated.
pub struct CommandLlmClient {
    command: String,
    timeout_secs: u64,
}

impl CommandLlmClient {
    pub fn new(command: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            timeout_secs,
        }
    }

    async fn invoke(&self, prompt: &str, tools: &[String]) -> Result<String> {
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .env("PHASEFLOW_TOOLS", tools.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PhaseflowError::Llm(format!("failed to spawn '{}': {}", self.command, e)))?;

        // Feed stdin while draining stdout/stderr, or a large prompt can
        // fill the pipe while the child blocks writing.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if let Err(e) = fed {
            // A child that exits without reading all input closes the pipe.
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PhaseflowError::Llm(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let completion = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if completion.is_empty() {
            return Err(PhaseflowError::Llm(format!(
                "'{}' produced no output",
                self.command
            )));
        }
        Ok(completion)
    }
}

impl LlmClient for CommandLlmClient {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
        tools: &'a [String],
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            debug!(command = %self.command, prompt_len = prompt.len(), "Invoking LLM command");
            let timeout = Duration::from_secs(self.timeout_secs);
            match tokio::time::timeout(timeout, self.invoke(prompt, tools)).await {
                Ok(result) => result,
                Err(_) => Err(PhaseflowError::Llm(format!(
                    "'{}' timed out after {}s",
                    self.command, self.timeout_secs
                ))),
            }
        })
    }
}

/// Question catalog held in memory, loaded from a bundle or built in code.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    questions: HashMap<String, CatalogQuestion>,
}

impl InMemoryCatalog {
    pub fn new(questions: Vec<CatalogQuestion>) -> Self {
        Self {
            questions: questions.into_iter().map(|q| (q.id.clone(), q)).collect(),
        }
    }

    pub fn insert(&mut self, question: CatalogQuestion) {
        self.questions.insert(question.id.clone(), question);
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

impl QuestionCatalog for InMemoryCatalog {
    fn get_question<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<CatalogQuestion>> {
        Box::pin(async move {
            self.questions
                .get(id)
                .cloned()
                .ok_or_else(|| PhaseflowError::Catalog(format!("unknown question '{}'", id)))
        })
    }
}

fn truncate_output(content: &mut String) {
    if content.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        content.push_str("\n... (output truncated)");
    }
    if content.is_empty() {
        content.push_str("(no output)");
    }
}
