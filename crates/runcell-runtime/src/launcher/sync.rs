//! JSON-lines messages between the runtime, the monitor and the
//! container children.
//!
//! Every exchange is a strict request/acknowledge sequence, so a message
//! is never buffered past the fork that duplicates a channel.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use runcell_common::error::{IsolationError, LaunchError, RuntimeError};

/// Which error family a child-side failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Namespace, mount or credential setup.
    Isolation,
    /// The entrypoint is not in the rootfs.
    ExecNotFound,
    /// A fatal hook failed.
    Hook,
    /// Anything else in the launch path.
    Launch,
}

/// A failure crossing a process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Error family.
    pub kind: FailureKind,
    /// Program or hook the failure is about, when relevant.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    /// Error text.
    pub message: String,
}

impl Failure {
    /// Flattens an error for transport.
    #[must_use]
    pub fn from_error(err: &RuntimeError) -> Self {
        let (kind, subject, message) = match err {
            RuntimeError::Isolation(e) => (FailureKind::Isolation, String::new(), e.to_string()),
            RuntimeError::Launch(LaunchError::ExecNotFound { program }) => {
                (FailureKind::ExecNotFound, program.clone(), String::new())
            }
            RuntimeError::Launch(LaunchError::Hook { hook, message }) => {
                (FailureKind::Hook, hook.clone(), message.clone())
            }
            RuntimeError::Launch(LaunchError::Setup { message }) => {
                (FailureKind::Launch, String::new(), message.clone())
            }
            other => (FailureKind::Launch, String::new(), other.to_string()),
        };
        Self {
            kind,
            subject,
            message,
        }
    }

    /// Rebuilds the error on the receiving side.
    #[must_use]
    pub fn into_error(self) -> RuntimeError {
        match self.kind {
            FailureKind::Isolation => IsolationError::Setup {
                step: "container setup",
                message: self.message,
            }
            .into(),
            FailureKind::ExecNotFound => LaunchError::ExecNotFound {
                program: self.subject,
            }
            .into(),
            FailureKind::Hook => LaunchError::Hook {
                hook: self.subject,
                message: self.message,
            }
            .into(),
            FailureKind::Launch => LaunchError::Setup {
                message: self.message,
            }
            .into(),
        }
    }
}

/// Messages between the monitor and the intermediate/init children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Child entered a new user namespace and needs its id maps.
    MappingRequest,
    /// Monitor wrote the id maps.
    MappingDone,
    /// Host pid of the forked init.
    InitPid {
        /// Pid in the monitor's pid namespace.
        pid: i32,
    },
    /// Monitor placed the init in its cgroup.
    Attached {
        /// Host pid of the init, for hook state documents.
        pid: i32,
    },
    /// Init finished mounts and waits for `createRuntime` hooks.
    MountsReady,
    /// Monitor ran the `createRuntime` hooks.
    HooksDone,
    /// Init is parked on the exec FIFO.
    Ready,
    /// Setup failed on the sending side.
    Error(Failure),
}

/// What the monitor tells the runtime once `create` is settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorReport {
    /// The init is parked and attached.
    Created {
        /// Host pid of the init.
        pid: i32,
    },
    /// Setup failed; every container process is gone.
    Failed(Failure),
}

fn sync_err(message: impl std::fmt::Display) -> LaunchError {
    LaunchError::Sync {
        message: message.to_string(),
    }
}

/// One end of a socketpair carrying JSON lines.
#[derive(Debug)]
pub struct SyncChannel {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl SyncChannel {
    /// Connected pair.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Sync`] if the socketpair cannot be created.
    pub fn pair() -> Result<(Self, Self), LaunchError> {
        let (a, b) = UnixStream::pair().map_err(sync_err)?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    fn new(stream: UnixStream) -> Result<Self, LaunchError> {
        let writer = stream.try_clone().map_err(sync_err)?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Sync`] if the peer is gone.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), LaunchError> {
        let mut line = serde_json::to_vec(message).map_err(sync_err)?;
        line.push(b'\n');
        self.writer.write_all(&line).map_err(sync_err)
    }

    /// Receives one message.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Sync`] on EOF or an unparsable line.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, LaunchError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(sync_err)?;
        if read == 0 {
            return Err(sync_err("peer closed the channel"));
        }
        serde_json::from_str(&line).map_err(sync_err)
    }

    /// Receives a message, turning a reported failure into its error.
    ///
    /// # Errors
    ///
    /// Returns the peer's error, or [`LaunchError::Sync`] on a broken
    /// channel.
    pub fn recv_sync(&mut self) -> Result<SyncMessage, RuntimeError> {
        match self.recv()? {
            SyncMessage::Error(failure) => Err(failure.into_error()),
            message => Ok(message),
        }
    }

    /// Receives a message and checks it is `expected`.
    ///
    /// # Errors
    ///
    /// Returns the peer's error, or [`LaunchError::Sync`] for any other
    /// message.
    pub fn expect(&mut self, expected: &SyncMessage) -> Result<(), RuntimeError> {
        let got = self.recv_sync()?;
        if &got == expected {
            Ok(())
        } else {
            Err(sync_err(format!("expected {expected:?}, got {got:?}")).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_cross_the_pair_in_order() {
        let (mut a, mut b) = SyncChannel::pair().unwrap();
        a.send(&SyncMessage::MappingRequest).unwrap();
        a.send(&SyncMessage::InitPid { pid: 77 }).unwrap();
        b.expect(&SyncMessage::MappingRequest).unwrap();
        assert_eq!(b.recv_sync().unwrap(), SyncMessage::InitPid { pid: 77 });
    }

    #[test]
    fn reported_failure_becomes_error() {
        let (mut a, mut b) = SyncChannel::pair().unwrap();
        let err: RuntimeError = LaunchError::ExecNotFound {
            program: "nginx".into(),
        }
        .into();
        a.send(&SyncMessage::Error(Failure::from_error(&err))).unwrap();
        let got = b.expect(&SyncMessage::Ready).unwrap_err();
        assert!(
            matches!(&got, RuntimeError::Launch(LaunchError::ExecNotFound { program }) if program == "nginx"),
            "{got}"
        );
    }

    #[test]
    fn closed_peer_is_a_sync_error() {
        let (a, mut b) = SyncChannel::pair().unwrap();
        drop(a);
        assert!(matches!(
            b.recv::<SyncMessage>(),
            Err(LaunchError::Sync { .. })
        ));
    }

    #[test]
    fn hook_failures_keep_their_hook() {
        let failure = Failure::from_error(
            &LaunchError::Hook {
                hook: "/bin/hook".into(),
                message: "exited with 1".into(),
            }
            .into(),
        );
        let json = serde_json::to_string(&MonitorReport::Failed(failure.clone())).unwrap();
        let back: MonitorReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MonitorReport::Failed(failure));
        let MonitorReport::Failed(f) = back else {
            unreachable!()
        };
        assert_eq!(
            f.into_error().to_string(),
            "hook /bin/hook failed: exited with 1"
        );
    }
}
