//! Signal names and exit status normalisation.

use std::str::FromStr;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Parses `KILL`, `SIGKILL`, `kill` or `9`.
#[must_use]
pub fn parse(input: &str) -> Option<Signal> {
    let input = input.trim();
    if let Ok(number) = input.parse::<i32>() {
        return Signal::try_from(number).ok();
    }
    let upper = input.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).ok()
}

/// Exit status as a shell reports it: the code, or `128 + signal`.
#[must_use]
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Exit code recorded when the runtime itself delivered `signal`.
#[must_use]
pub const fn killed_by(signal: Signal) -> i32 {
    128 + signal as i32
}

/// Signals that must not be forwarded to the container in the foreground.
#[must_use]
pub const fn is_local(signal: Signal) -> bool {
    matches!(signal, Signal::SIGCHLD | Signal::SIGURG | Signal::SIGWINCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::unistd::Pid;

    #[test]
    fn names_numbers_and_prefixes_parse() {
        assert_eq!(parse("9"), Some(Signal::SIGKILL));
        assert_eq!(parse("KILL"), Some(Signal::SIGKILL));
        assert_eq!(parse("sigterm"), Some(Signal::SIGTERM));
        assert_eq!(parse("SIGHUP"), Some(Signal::SIGHUP));
        assert_eq!(parse("NOPE"), None);
        assert_eq!(parse("999"), None);
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
        assert_eq!(killed_by(Signal::SIGTERM), 143);
    }
}
