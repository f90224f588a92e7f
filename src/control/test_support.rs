// Scripted command runner for tests

use crate::control::models::CommandOutput;
use crate::control::runner::{CommandRunner, RunningCommand};
use crate::error::RunnerError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a scripted program does once spawned
#[derive(Debug, Clone)]
pub enum Script {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
        delay: Duration,
    },
    /// Never exits on its own; terminates on request
    Hang,
    /// Never exits and ignores termination
    Unkillable,
    /// Fails to spawn
    Missing,
    /// Panics while being waited on
    Panic,
    /// Waiting fails while the process keeps running
    Broken,
}

impl Script {
    pub fn exit(code: i32) -> Self {
        Script::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        if let Script::Exit { stdout, .. } = &mut self {
            *stdout = text.to_string();
        }
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        if let Script::Exit { stderr, .. } = &mut self {
            *stderr = text.to_string();
        }
        self
    }

    pub fn after(mut self, wait: Duration) -> Self {
        if let Script::Exit { delay, .. } = &mut self {
            *delay = wait;
        }
        self
    }
}

/// Runner whose programs behave according to scripts keyed by argv[0]
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    spawned: Mutex<Vec<Vec<String>>>,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, program: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(program.to_string(), script);
    }

    /// Every argv spawned so far, in order
    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl CommandRunner for ScriptedRunner {
    fn spawn(&self, argv: &[String]) -> Result<Box<dyn RunningCommand>, RunnerError> {
        let program = argv.first().ok_or(RunnerError::EmptyCommand)?.clone();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&program)
            .cloned()
            .unwrap_or_else(|| Script::exit(0));

        if let Script::Missing = script {
            return Err(RunnerError::Spawn {
                program,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }

        self.spawned.lock().unwrap().push(argv.to_vec());
        Ok(Box::new(ScriptedCommand {
            script,
            started: Instant::now(),
            terminations: self.terminations.clone(),
        }))
    }
}

struct ScriptedCommand {
    script: Script,
    started: Instant,
    terminations: Arc<AtomicUsize>,
}

impl RunningCommand for ScriptedCommand {
    fn wait(&mut self) -> BoxFuture<'_, Result<CommandOutput, RunnerError>> {
        Box::pin(async move {
            match &self.script {
                Script::Exit {
                    code,
                    stdout,
                    stderr,
                    delay,
                } => {
                    tokio::time::sleep(*delay).await;
                    Ok(CommandOutput {
                        exit_code: *code,
                        stdout: stdout.clone().into_bytes(),
                        stderr: stderr.clone().into_bytes(),
                    })
                }
                Script::Panic => panic!("scripted command panicked"),
                Script::Broken => Err(RunnerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "wait failed",
                ))),
                _ => futures::future::pending().await,
            }
        })
    }

    fn has_exited(&mut self) -> bool {
        match &self.script {
            Script::Exit { delay, .. } => self.started.elapsed() >= *delay,
            _ => false,
        }
    }

    fn terminate(&mut self, _grace: Duration) -> BoxFuture<'_, Result<(), RunnerError>> {
        Box::pin(async move {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Unkillable => Err(RunnerError::NotTerminated("SIGKILL".to_string())),
                _ => Ok(()),
            }
        })
    }
}
