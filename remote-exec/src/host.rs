// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::scp;
use crate::CommandOutput;
use crate::RemoteShell;
use crate::ShellError;
use crate::Transcript;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::fmt;
use tokio::sync::mpsc;

/// Owner given to every uploaded file.
pub const SERVICE_OWNER: &str = "ravendb:ravendb";

/// Uploads are streamed to `scp` in chunks of this size.
const UPLOAD_CHUNK_SIZE: usize = 32 * 1024;
const UPLOAD_QUEUE_DEPTH: usize = 4;

/// Quotes `arg` for a POSIX shell.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitStatus(pub Option<u32>);

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit status {code}"),
            None => write!(f, "no exit status"),
        }
    }
}

/// A remote command or transfer failed.
///
/// Both variants carry the session transcript up to and including the
/// failure (and any diagnostic command run afterwards).
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("`{command}` failed on {address} ({status}) with output:\n{transcript}")]
    CommandFailed {
        address: String,
        command: String,
        status: ExitStatus,
        transcript: String,
    },
    #[error("`{command}` could not be run on {address} with output:\n{transcript}")]
    Session {
        address: String,
        command: String,
        transcript: String,
        #[source]
        err: ShellError,
    },
}

impl DeployError {
    pub fn transcript(&self) -> &str {
        match self {
            DeployError::CommandFailed { transcript, .. }
            | DeployError::Session { transcript, .. } => transcript,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            DeployError::CommandFailed { command, .. }
            | DeployError::Session { command, .. } => command,
        }
    }
}

/// An open connection to one host plus the transcript of everything run on
/// it.
pub struct RemoteHost {
    address: String,
    shell: Box<dyn RemoteShell>,
    transcript: Transcript,
    log: Logger,
}

impl std::fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHost")
            .field("address", &self.address)
            .field("transcript", &self.transcript)
            .finish_non_exhaustive()
    }
}

impl RemoteHost {
    pub fn new(address: String, shell: Box<dyn RemoteShell>, log: Logger) -> Self {
        Self { address, shell, transcript: Transcript::new(), log }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Runs `commands` in order, each in a fresh channel.
    ///
    /// On the first failure, `on_failure` (if given) runs once so its output
    /// lands in the transcript, and the sequence stops. Returns the
    /// transcript on success.
    pub async fn run_sequence<S: AsRef<str>>(
        &self,
        commands: &[S],
        on_failure: Option<&str>,
    ) -> Result<String, DeployError> {
        for command in commands {
            let command = command.as_ref();
            self.transcript.append_line(&format!("$ {command}"));
            match self.shell.exec(command, None).await {
                Ok(output) => {
                    self.record(&output);
                    if !output.success() {
                        warn!(
                            self.log,
                            "remote command failed";
                            "command" => command,
                            "status" => %ExitStatus(output.exit_status),
                        );
                        self.run_diagnostics(on_failure).await;
                        return Err(self.command_failed(command, &output));
                    }
                }
                Err(err) => {
                    self.run_diagnostics(on_failure).await;
                    return Err(self.session_failed(command, err));
                }
            }
        }
        Ok(self.transcript.contents())
    }

    /// Runs `command` once and reports whether it exited successfully.
    ///
    /// A non-zero exit status is an answer, not an error.
    pub async fn probe(&self, command: &str) -> Result<bool, DeployError> {
        match self.shell.exec(command, None).await {
            Ok(output) => Ok(output.success()),
            Err(err) => Err(self.session_failed(command, err)),
        }
    }

    /// Copies `content` to `path` and hands it to [`SERVICE_OWNER`].
    ///
    /// The `scp` payload is fed to the remote end from a separate task,
    /// which notes in the transcript how much of it went out.
    pub async fn upload(&self, path: &str, content: &[u8]) -> Result<(), DeployError> {
        let command = format!("sudo scp -t {}", quote(path));
        debug!(self.log, "uploading file"; "path" => path, "bytes" => content.len());
        self.transcript.append_line(&format!("$ {command}"));

        let payload = scp::encode_single_file(content);
        let (tx, rx) = mpsc::channel(UPLOAD_QUEUE_DEPTH);
        let pump_transcript = self.transcript.clone();
        let pump = tokio::spawn(async move {
            let mut sent = 0;
            for chunk in payload.chunks(UPLOAD_CHUNK_SIZE) {
                if tx.send(chunk.to_vec()).await.is_err() {
                    pump_transcript.append_line(&format!(
                        "upload stream closed after {sent} of {} bytes",
                        payload.len()
                    ));
                    return;
                }
                sent += chunk.len();
            }
            pump_transcript.append_line(&format!("sent {sent} bytes"));
        });

        let result = self.shell.exec(&command, Some(rx)).await;
        if let Err(err) = pump.await {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
        let output = result.map_err(|err| self.session_failed(&command, err))?;
        self.record(&output);
        if let Some(message) = scp::find_rejection(&output.stdout) {
            self.transcript.append_line(&message);
            return Err(self.command_failed(&command, &output));
        }
        if !output.success() {
            return Err(self.command_failed(&command, &output));
        }

        self.run_sequence(
            &[format!("sudo chown {SERVICE_OWNER} {}", quote(path))],
            None,
        )
        .await?;
        Ok(())
    }

    /// Lists the regular files directly inside `dir`, as absolute paths.
    pub async fn list_files(&self, dir: &str) -> Result<Vec<String>, DeployError> {
        let command = format!("sudo find {} -maxdepth 1 -type f", quote(dir));
        self.transcript.append_line(&format!("$ {command}"));
        let output = self
            .shell
            .exec(&command, None)
            .await
            .map_err(|err| self.session_failed(&command, err))?;
        if !output.success() {
            self.record(&output);
            return Err(self.command_failed(&command, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Returns the contents of `path`. An empty file yields an empty vector;
    /// a missing or unreadable file is an error.
    ///
    /// File contents are deliberately kept out of the transcript.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, DeployError> {
        let command = format!("sudo cat {}", quote(path));
        self.transcript.append_line(&format!("$ {command}"));
        let output = self
            .shell
            .exec(&command, None)
            .await
            .map_err(|err| self.session_failed(&command, err))?;
        if !output.success() {
            self.record(&output);
            return Err(self.command_failed(&command, &output));
        }
        Ok(output.stdout)
    }

    pub async fn close(self) {
        self.shell.close().await;
    }

    async fn run_diagnostics(&self, on_failure: Option<&str>) {
        let Some(command) = on_failure.filter(|c| !c.trim().is_empty()) else {
            return;
        };
        self.transcript.append_line(&format!("$ {command}"));
        match self.shell.exec(command, None).await {
            Ok(output) => self.record(&output),
            Err(err) => {
                self.transcript.append_line(&format!("{err:#}"));
            }
        }
    }

    fn record(&self, output: &CommandOutput) {
        self.transcript.append(&output.stdout);
        self.transcript.append(&output.stderr);
    }

    fn command_failed(&self, command: &str, output: &CommandOutput) -> DeployError {
        DeployError::CommandFailed {
            address: self.address.clone(),
            command: command.to_string(),
            status: ExitStatus(output.exit_status),
            transcript: self.transcript.contents(),
        }
    }

    fn session_failed(&self, command: &str, err: ShellError) -> DeployError {
        self.transcript.append_line(&format!("{err}"));
        DeployError::Session {
            address: self.address.clone(),
            command: command.to_string(),
            transcript: self.transcript.contents(),
            err,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::FakeShell;

    fn host(shell: &FakeShell) -> RemoteHost {
        RemoteHost::new(
            "10.0.0.5:22".to_string(),
            Box::new(shell.clone()),
            Logger::root(slog::Discard, slog::o!()),
        )
    }

    #[tokio::test]
    async fn sequence_runs_every_command_in_order() {
        let shell = FakeShell::new();
        shell.respond("echo hello", b"hello\n");
        let host = host(&shell);

        let transcript = host
            .run_sequence(&["echo hello", "sudo systemctl restart ravendb"], None)
            .await
            .unwrap();

        assert_eq!(
            shell.commands(),
            ["echo hello", "sudo systemctl restart ravendb"]
        );
        assert!(transcript.contains("$ echo hello\nhello\n"));
    }

    #[tokio::test]
    async fn failure_runs_diagnostics_and_stops() {
        let shell = FakeShell::new();
        shell.fail_on("apt-get install", 100, "E: Unable to locate package");
        shell.respond("systemctl status", b"inactive (dead)\n");
        let host = host(&shell);

        let err = host
            .run_sequence(
                &[
                    "wget -nv -O ravendb.deb https://example.com/pkg",
                    "sudo apt-get install -y -f ./ravendb.deb",
                    "sudo systemctl restart ravendb",
                ],
                Some("sudo systemctl status ravendb"),
            )
            .await
            .expect_err("install fails");

        assert_eq!(
            shell.commands(),
            [
                "wget -nv -O ravendb.deb https://example.com/pkg",
                "sudo apt-get install -y -f ./ravendb.deb",
                "sudo systemctl status ravendb",
            ]
        );
        assert_eq!(err.command(), "sudo apt-get install -y -f ./ravendb.deb");
        assert!(err.transcript().contains("E: Unable to locate package"));
        assert!(err.transcript().contains("inactive (dead)"));
        assert!(err.to_string().contains("exit status 100"));
    }

    #[tokio::test]
    async fn blank_diagnostic_command_is_skipped() {
        let shell = FakeShell::new();
        shell.fail_on("false", 1, "");
        let host = host(&shell);

        host.run_sequence(&["false"], Some("  ")).await.unwrap_err();
        assert_eq!(shell.commands(), ["false"]);
    }

    #[tokio::test]
    async fn upload_streams_payload_then_fixes_ownership() {
        let shell = FakeShell::new();
        let host = host(&shell);

        host.upload("/etc/ravendb/license.json", b"{\"Id\":1}").await.unwrap();

        assert_eq!(
            shell.commands(),
            [
                "sudo scp -t '/etc/ravendb/license.json'",
                "sudo chown ravendb:ravendb '/etc/ravendb/license.json'",
            ]
        );
        assert_eq!(
            shell.file("/etc/ravendb/license.json").as_deref(),
            Some(&b"{\"Id\":1}"[..])
        );
    }

    #[tokio::test]
    async fn upload_rejected_by_scp_is_fatal() {
        let shell = FakeShell::new();
        shell.respond_with(
            "sudo scp -t",
            CommandOutput {
                stdout: b"\x01scp: /etc/x: Read-only file system\n".to_vec(),
                stderr: Vec::new(),
                exit_status: Some(0),
            },
        );
        let host = host(&shell);

        let err = host.upload("/etc/x", b"data").await.unwrap_err();
        assert!(err.transcript().contains("Read-only file system"));
        // Ownership is never touched after a failed copy.
        assert_eq!(shell.commands(), ["sudo scp -t '/etc/x'"]);
    }

    #[tokio::test]
    async fn list_and_read_files() {
        let shell = FakeShell::new();
        shell.add_file("/etc/ravendb/settings.json", b"{}");
        shell.add_file("/etc/ravendb/empty.txt", b"");
        shell.add_file("/etc/ravendb/security/server.pfx", b"pfx");
        let host = host(&shell);

        let files = host.list_files("/etc/ravendb").await.unwrap();
        assert_eq!(files, ["/etc/ravendb/empty.txt", "/etc/ravendb/settings.json"]);

        assert_eq!(host.read_file("/etc/ravendb/empty.txt").await.unwrap(), b"");
        assert_eq!(
            host.read_file("/etc/ravendb/settings.json").await.unwrap(),
            b"{}"
        );
        let err = host.read_file("/etc/ravendb/missing").await.unwrap_err();
        assert!(err.transcript().contains("No such file or directory"));
    }

    #[tokio::test]
    async fn paths_with_spaces_and_quotes_survive_the_shell() {
        let shell = FakeShell::new();
        let host = host(&shell);
        let path = "/opt/my plugins/it's.conf";

        host.upload(path, b"plugin").await.unwrap();

        assert_eq!(
            shell.commands(),
            [
                r"sudo scp -t '/opt/my plugins/it'\''s.conf'",
                r"sudo chown ravendb:ravendb '/opt/my plugins/it'\''s.conf'",
            ]
        );
        assert_eq!(host.list_files("/opt/my plugins").await.unwrap(), [path]);
        assert_eq!(host.read_file(path).await.unwrap(), b"plugin");
    }

    #[tokio::test]
    async fn large_upload_is_streamed_in_chunks() {
        let shell = FakeShell::new();
        let host = host(&shell);
        let content = vec![7u8; UPLOAD_CHUNK_SIZE * 3 + 17];

        host.upload("/etc/ravendb/big.bin", &content).await.unwrap();

        assert_eq!(shell.file("/etc/ravendb/big.bin"), Some(content.clone()));
        let sent = scp::encode_single_file(&content).len();
        let transcript = host.transcript().contents();
        assert!(
            transcript.contains(&format!("sent {sent} bytes\n")),
            "{transcript}"
        );
    }

    #[tokio::test]
    async fn upload_that_loses_its_session_reports_the_stream() {
        let shell = FakeShell::new();
        shell.lose_session_on("scp -t");
        let host = host(&shell);

        let err = host.upload("/etc/x", b"data").await.unwrap_err();
        assert!(matches!(err, DeployError::Session { .. }));
        assert!(err.transcript().contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn probe_reports_exit_status_without_failing() {
        let shell = FakeShell::new();
        shell.fail_on("test -f", 1, "");
        let host = host(&shell);

        assert!(!host.probe("test -f /var/lib/cloud/instance/boot-finished").await.unwrap());
        assert!(host.probe("true").await.unwrap());
    }
}
