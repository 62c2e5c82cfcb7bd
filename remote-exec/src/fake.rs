// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for [`Connector`] and [`RemoteShell`].
//!
//! [`FakeShell`] keeps a tiny filesystem so that `sudo cat`, `sudo find`,
//! `sudo rm` and `sudo scp -t` behave the way provisioning expects. Any other
//! command succeeds with no output unless a rule says otherwise.

use crate::scp;
use crate::CommandOutput;
use crate::Connector;
use crate::DialError;
use crate::RemoteShell;
use crate::ShellError;
use crate::StdinStream;
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Clone, Debug)]
enum Reply {
    Output(CommandOutput),
    SessionLost,
}

#[derive(Clone, Debug)]
struct Rule {
    pattern: String,
    reply: Reply,
    /// `None` means the rule never expires.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct ShellState {
    commands: Vec<String>,
    stdin: Vec<(String, Vec<u8>)>,
    rules: Vec<Rule>,
    files: BTreeMap<String, Vec<u8>>,
    closed: bool,
}

/// A scripted shell. Clones share state, so a test can keep one handle while
/// the code under test owns another.
#[derive(Clone, Debug, Default)]
pub struct FakeShell {
    state: Arc<Mutex<ShellState>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShellState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_rule(&self, pattern: &str, reply: Reply, remaining: Option<usize>) {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
    }

    /// Commands containing `pattern` succeed and print `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &[u8]) {
        self.respond_with(
            pattern,
            CommandOutput {
                stdout: stdout.to_vec(),
                stderr: Vec::new(),
                exit_status: Some(0),
            },
        );
    }

    pub fn respond_with(&self, pattern: &str, output: CommandOutput) {
        self.push_rule(pattern, Reply::Output(output), None);
    }

    /// Commands containing `pattern` exit with `status` and print `stderr`.
    pub fn fail_on(&self, pattern: &str, status: u32, stderr: &str) {
        self.push_rule(pattern, Self::failure(status, stderr), None);
    }

    /// Like [`FakeShell::fail_on`], but only for the first `times` matches.
    pub fn fail_first(&self, pattern: &str, times: usize, status: u32) {
        self.push_rule(pattern, Self::failure(status, ""), Some(times));
    }

    /// Commands containing `pattern` fail at the transport level.
    pub fn lose_session_on(&self, pattern: &str) {
        self.push_rule(pattern, Reply::SessionLost, None);
    }

    fn failure(status: u32, stderr: &str) -> Reply {
        Reply::Output(CommandOutput {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit_status: Some(status),
        })
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.lock().files.insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock().files.clone()
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// True if some command run so far contains `pattern`.
    pub fn ran(&self, pattern: &str) -> bool {
        self.lock().commands.iter().any(|c| c.contains(pattern))
    }

    /// Input written to the first command containing `pattern`.
    pub fn stdin_for(&self, pattern: &str) -> Option<Vec<u8>> {
        self.lock()
            .stdin
            .iter()
            .find(|(command, _)| command.contains(pattern))
            .map(|(_, input)| input.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn scripted_reply(state: &mut ShellState, command: &str) -> Option<Reply> {
        let rule = state.rules.iter_mut().find(|rule| {
            command.contains(&rule.pattern) && rule.remaining != Some(0)
        })?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.reply.clone())
    }

    fn builtin(
        state: &mut ShellState,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> CommandOutput {
        let ok = |stdout: Vec<u8>| CommandOutput {
            stdout,
            stderr: Vec::new(),
            exit_status: Some(0),
        };
        let failed = |stderr: String| CommandOutput {
            stdout: Vec::new(),
            stderr: stderr.into_bytes(),
            exit_status: Some(1),
        };

        if let Some(path) = command.strip_prefix("sudo cat ") {
            let path = unquote(path);
            return match state.files.get(&path) {
                Some(content) => ok(content.clone()),
                None => {
                    failed(format!("cat: {path}: No such file or directory\n"))
                }
            };
        }
        if let Some(rest) = command.strip_prefix("sudo find ") {
            let Some((dir, _)) = rest.split_once(" -maxdepth") else {
                return failed(format!("find: bad invocation {command:?}\n"));
            };
            let prefix = format!("{}/", unquote(dir).trim_end_matches('/'));
            let mut listing = String::new();
            for path in state.files.keys() {
                if let Some(name) = path.strip_prefix(&prefix) {
                    if !name.contains('/') {
                        listing.push_str(path);
                        listing.push('\n');
                    }
                }
            }
            return ok(listing.into_bytes());
        }
        if let Some(path) = command.strip_prefix("sudo scp -t ") {
            return match scp::decode_single_file(stdin.unwrap_or_default()) {
                Ok((_mode, content)) => {
                    state.files.insert(unquote(path), content);
                    ok(vec![0, 0, 0])
                }
                Err(err) => CommandOutput {
                    stdout: format!("\x02scp: protocol error: {err}\n")
                        .into_bytes(),
                    stderr: Vec::new(),
                    exit_status: Some(1),
                },
            };
        }
        if let Some(path) = command.strip_prefix("sudo rm ") {
            state.files.remove(&unquote(path.trim_start_matches("-f ")));
            return ok(Vec::new());
        }
        ok(Vec::new())
    }
}

/// Undoes single-quoting as a POSIX shell would. Unquoted text is taken
/// as is, apart from backslash escapes.
fn unquote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.trim().chars();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<StdinStream>,
    ) -> Result<CommandOutput, ShellError> {
        let stdin = match stdin {
            Some(mut chunks) => {
                let mut input = Vec::new();
                while let Some(chunk) = chunks.recv().await {
                    input.extend_from_slice(&chunk);
                }
                Some(input)
            }
            None => None,
        };
        let mut state = self.lock();
        state.commands.push(command.to_string());
        if let Some(input) = &stdin {
            state.stdin.push((command.to_string(), input.clone()));
        }
        match Self::scripted_reply(&mut state, command) {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::SessionLost) => Err(ShellError {
                command: command.to_string(),
                source: anyhow!("connection reset by peer"),
            }),
            None => Ok(Self::builtin(&mut state, command, stdin.as_deref())),
        }
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    hosts: BTreeMap<String, FakeShell>,
    transient_failures: BTreeMap<String, usize>,
    unreachable: BTreeSet<String>,
    rejected: BTreeSet<String>,
    dials: BTreeMap<String, usize>,
}

/// Hands out [`FakeShell`]s by host name.
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub const USER: &'static str = "ubuntu";

    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_host(&self, host: &str, shell: FakeShell) {
        self.lock().hosts.insert(host.to_string(), shell);
    }

    /// The shell registered for `host`.
    ///
    /// # Panics
    ///
    /// Panics if `host` was never added.
    pub fn shell(&self, host: &str) -> FakeShell {
        self.lock()
            .hosts
            .get(host)
            .cloned()
            .unwrap_or_else(|| panic!("no fake shell for {host}"))
    }

    pub fn fail_first_dials(&self, host: &str, times: usize) {
        self.lock().transient_failures.insert(host.to_string(), times);
    }

    pub fn mark_unreachable(&self, host: &str) {
        self.lock().unreachable.insert(host.to_string());
    }

    pub fn reject_key(&self, host: &str) {
        self.lock().rejected.insert(host.to_string());
    }

    pub fn dial_count(&self, host: &str) -> usize {
        self.lock().dials.get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn address(&self, host: &str) -> String {
        format!("{host}:{}", crate::DEFAULT_SSH_PORT)
    }

    async fn dial(&self, host: &str) -> Result<Box<dyn RemoteShell>, DialError> {
        let mut state = self.lock();
        *state.dials.entry(host.to_string()).or_default() += 1;

        if state.rejected.contains(host) {
            return Err(DialError::AuthenticationRejected {
                user: Self::USER.to_string(),
            });
        }
        if state.unreachable.contains(host) {
            return Err(DialError::Transport(anyhow!(
                "connect to {host}: connection refused"
            )));
        }
        if let Some(left) = state.transient_failures.get_mut(host) {
            if *left > 0 {
                *left -= 1;
                return Err(DialError::Transport(anyhow!(
                    "connect to {host}: connection timed out"
                )));
            }
        }
        match state.hosts.get(host) {
            Some(shell) => Ok(Box::new(shell.clone())),
            None => Err(DialError::Transport(anyhow!(
                "connect to {host}: no route to host"
            ))),
        }
    }
}
