//! Parallel command executor.
//!
//! A batch of [`CommandTarget`]s is fanned out concurrently on the calling
//! task and joined back in input order. Each command runs under its own
//! timeout; a failure or timeout is recorded as a value in that target's
//! result and never disturbs its siblings.
//!
//! Transport is chosen per target at dispatch time: hosts that resolve to
//! this machine run as local processes, everything else is wrapped in ssh
//! (or scp for file pushes). Local processes get the same timeout as remote
//! ones; only daemons started through [`Dispatcher::launch`] run unbounded.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as Process};
use tokio::time::timeout;

use crate::config::SshConfig;
use crate::error::{ExecError, Result};
use crate::resolver::HostResolver;
use crate::types::{Command, CommandTarget, ExecutionResult, Output};

/// Concrete process invocation for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Run directly on this machine.
    Local(Vec<String>),
    /// Run through ssh on another machine.
    Remote {
        user: String,
        host: String,
        args: Vec<String>,
    },
}

impl Invocation {
    /// Full argument vector, program first.
    pub fn argv(&self, ssh: &SshConfig) -> Vec<String> {
        match self {
            Invocation::Local(args) => args.clone(),
            Invocation::Remote { user, host, args } => {
                let mut argv = vec![ssh.program.clone()];
                argv.extend(ssh.options.iter().cloned());
                argv.push(format!("{}@{}", user, host));
                argv.extend(args.iter().cloned());
                argv
            }
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Invocation::Local(_))
    }
}

/// A daemon to be started on a host.
///
/// Dispatched remotely it becomes `mkdir -p <dirs> && <program> <args> <detach_args>`.
/// Launched on this machine the directories are created here and the program
/// runs in the foreground under an owned handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub dirs: Vec<String>,
    pub detach_args: Vec<String>,
}

impl LaunchSpec {
    pub fn shell_line(&self) -> String {
        let mut parts = Vec::new();
        if !self.dirs.is_empty() {
            parts.push(format!("mkdir -p {} &&", self.dirs.join(" ")));
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.extend(self.detach_args.iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

/// Quote one shell word unless it is obviously safe.
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,=@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// A daemon started on this machine; the process keeps running when dropped.
#[derive(Debug)]
pub struct DaemonHandle {
    pub label: String,
    child: Child,
}

impl DaemonHandle {
    pub fn new(label: impl Into<String>, child: Child) -> Self {
        Self {
            label: label.into(),
            child,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// How a daemon start was carried out.
#[derive(Debug)]
pub enum DaemonStart {
    /// Launched here, the caller owns the process.
    Handle(DaemonHandle),
    /// Sent to a remote host; success is only what the dispatch reported.
    Dispatched(ExecutionResult),
}

impl DaemonStart {
    pub fn is_error(&self) -> bool {
        match self {
            DaemonStart::Handle(_) => false,
            DaemonStart::Dispatched(result) => result.is_error(),
        }
    }
}

/// Seam between the orchestrators and process execution.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn is_self(&self, host: &str) -> Result<bool>;

    /// Run a batch concurrently. Exactly one result per target, in input order.
    /// Fails only if a target's transport cannot be resolved, before anything runs.
    async fn execute(&self, targets: Vec<CommandTarget>) -> Result<Vec<ExecutionResult>>;

    /// Start a daemon on this machine and hand back its process.
    async fn launch(&self, spec: &LaunchSpec) -> Result<DaemonHandle>;
}

pub struct ParallelExecutor {
    resolver: Arc<dyn HostResolver>,
    timeout: Duration,
    ssh: SshConfig,
}

impl ParallelExecutor {
    pub fn new(resolver: Arc<dyn HostResolver>, timeout: Duration, ssh: SshConfig) -> Self {
        Self {
            resolver,
            timeout,
            ssh,
        }
    }

    /// Same transport settings with a different per-command timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            timeout,
            ssh: self.ssh.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decide how `target` will be run.
    pub async fn invocation(&self, target: &CommandTarget) -> Result<Invocation> {
        let local = self.resolver.is_self(&target.host).await?;
        let invocation = match (&target.command, local) {
            (Command::Shell { line }, true) => {
                Invocation::Local(vec!["sh".into(), "-c".into(), line.clone()])
            }
            (Command::Shell { line }, false) => Invocation::Remote {
                user: target.user.clone(),
                host: target.host.clone(),
                args: vec![line.clone()],
            },
            (Command::Push { source, dest }, true) => Invocation::Local(vec![
                "cp".into(),
                source.display().to_string(),
                expand_home(dest).display().to_string(),
            ]),
            (Command::Push { source, dest }, false) => {
                let mut argv = vec![self.ssh.copy_program.clone()];
                argv.extend(self.ssh.options.iter().cloned());
                argv.push(source.display().to_string());
                argv.push(format!("{}@{}:{}", target.user, target.host, dest));
                Invocation::Local(argv)
            }
        };
        Ok(invocation)
    }

    async fn run(&self, run_num: usize, target: CommandTarget, argv: Vec<String>) -> ExecutionResult {
        debug!("run: {} running command {:?}", run_num, argv);
        match run_with_timeout(&argv, self.timeout).await {
            Ok(output) => {
                debug!("run: {} finished", run_num);
                ExecutionResult::completed(target, output)
            }
            Err(e) => {
                if e.is_timeout() {
                    error!("run: {} took too long: {}", run_num, target);
                } else {
                    error!("run: {} failed: {}", run_num, e);
                }
                ExecutionResult::failed(target, e)
            }
        }
    }
}

#[async_trait]
impl Dispatcher for ParallelExecutor {
    async fn is_self(&self, host: &str) -> Result<bool> {
        self.resolver.is_self(host).await
    }

    async fn execute(&self, targets: Vec<CommandTarget>) -> Result<Vec<ExecutionResult>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut planned = Vec::with_capacity(targets.len());
        for target in targets {
            let argv = self.invocation(&target).await?.argv(&self.ssh);
            planned.push((target, argv));
        }

        let runs = planned
            .into_iter()
            .enumerate()
            .map(|(i, (target, argv))| self.run(i + 1, target, argv));
        Ok(join_all(runs).await)
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<DaemonHandle> {
        for dir in &spec.dirs {
            tokio::fs::create_dir_all(expand_home(dir)).await?;
        }
        let child = Process::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!("Launched {} locally (pid {:?})", spec.label, child.id());
        Ok(DaemonHandle::new(spec.label.clone(), child))
    }
}

/// Spawn `argv`, capture both streams, and kill the process if it outlives `limit`.
async fn run_with_timeout(argv: &[String], limit: Duration) -> std::result::Result<Output, ExecError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ExecError::Io("empty command".into()))?;

    let mut child = Process::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let finished = timeout(limit, async {
        let (status, out, err) = tokio::join!(
            child.wait(),
            drain(stdout.as_mut()),
            drain(stderr.as_mut())
        );
        Ok::<_, std::io::Error>((status?, out?, err?))
    })
    .await;

    match finished {
        Ok(Ok((status, out, err))) => Ok(Output {
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            exit_code: status.code(),
        }),
        Ok(Err(e)) => Err(ExecError::Io(e.to_string())),
        Err(_) => {
            // kill() also reaps the child
            let _ = child.kill().await;
            Err(ExecError::Timeout(limit))
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<&mut R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Resolve a leading `~/` against `$HOME` for local paths.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}
