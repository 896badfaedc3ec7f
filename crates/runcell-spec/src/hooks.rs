//! Lifecycle hook entries from the `hooks` section of `config.json`.
//!
//! Every hook receives the container state document on stdin. Where a
//! hook runs is decided by its [`HookPoint`]; this module only orders and
//! validates the entries parsed by [`oci_spec`].

use std::fmt;

use runcell_common::error::SpecError;

use crate::config::{Hook, Hooks};

/// Hooks registered for `point`, in execution order.
///
/// `prestart` is the legacy name for `createRuntime`; its entries run
/// first.
pub fn at(hooks: &Hooks, point: HookPoint) -> impl Iterator<Item = &Hook> {
    let (first, second) = match point {
        HookPoint::CreateRuntime => (hooks.prestart(), Some(hooks.create_runtime())),
        HookPoint::CreateContainer => (hooks.create_container(), None),
        HookPoint::StartContainer => (hooks.start_container(), None),
        HookPoint::Poststart => (hooks.poststart(), None),
        HookPoint::Poststop => (hooks.poststop(), None),
    };
    [Some(first), second].into_iter().flatten().flatten().flatten()
}

/// Whether no hook is configured anywhere.
#[must_use]
pub fn is_empty(hooks: &Hooks) -> bool {
    HookPoint::ALL.iter().all(|p| at(hooks, *p).next().is_none())
}

/// Checks every entry.
///
/// # Errors
///
/// Returns [`SpecError::Invalid`] naming the first offending hook.
pub fn validate(hooks: &Hooks) -> Result<(), SpecError> {
    for point in HookPoint::ALL {
        for hook in at(hooks, point) {
            validate_hook(hook, point)?;
        }
    }
    Ok(())
}

fn validate_hook(hook: &Hook, point: HookPoint) -> Result<(), SpecError> {
    let path = hook.path();
    if !path.is_absolute() {
        return Err(SpecError::Invalid {
            message: format!("{point} hook path must be absolute: {}", path.display()),
        });
    }
    if hook.timeout().is_some_and(|secs| secs <= 0) {
        return Err(SpecError::Invalid {
            message: format!("{point} hook {} needs a positive timeout", path.display()),
        });
    }
    Ok(())
}

/// Lifecycle point at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// `createRuntime` (and legacy `prestart`).
    CreateRuntime,
    /// `createContainer`.
    CreateContainer,
    /// `startContainer`.
    StartContainer,
    /// `poststart`.
    Poststart,
    /// `poststop`.
    Poststop,
}

impl HookPoint {
    /// Every point, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::CreateRuntime,
        Self::CreateContainer,
        Self::StartContainer,
        Self::Poststart,
        Self::Poststop,
    ];

    /// Name used in `config.json`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateRuntime => "createRuntime",
            Self::CreateContainer => "createContainer",
            Self::StartContainer => "startContainer",
            Self::Poststart => "poststart",
            Self::Poststop => "poststop",
        }
    }

    /// Whether failures at this point abort the operation.
    ///
    /// `poststart` and `poststop` failures are only logged.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Poststart | Self::Poststop)
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::config::{HookBuilder, HooksBuilder};

    fn hook(path: &str) -> Hook {
        HookBuilder::default().path(path).build().unwrap()
    }

    #[test]
    fn prestart_runs_before_create_runtime() {
        let hooks = HooksBuilder::default()
            .prestart(vec![hook("/bin/old")])
            .create_runtime(vec![hook("/bin/new")])
            .build()
            .unwrap();
        let paths: Vec<PathBuf> = at(&hooks, HookPoint::CreateRuntime)
            .map(|h| h.path().clone())
            .collect();
        assert_eq!(paths, vec![PathBuf::from("/bin/old"), PathBuf::from("/bin/new")]);
        assert_eq!(at(&hooks, HookPoint::Poststop).count(), 0);
    }

    #[test]
    fn relative_path_is_rejected() {
        let hooks = HooksBuilder::default()
            .poststop(vec![hook("bin/cleanup")])
            .build()
            .unwrap();
        let err = validate(&hooks).unwrap_err();
        assert!(err.to_string().contains("poststop"));
    }

    #[test]
    fn non_positive_timeout_is_rejected() {
        for timeout in [0, -5] {
            let entry = HookBuilder::default()
                .path("/bin/true")
                .timeout(timeout)
                .build()
                .unwrap();
            let hooks = HooksBuilder::default()
                .start_container(vec![entry])
                .build()
                .unwrap();
            assert!(matches!(validate(&hooks), Err(SpecError::Invalid { .. })));
        }
    }

    #[test]
    fn parses_camel_case_sections() {
        let json = r#"{
            "createRuntime": [ { "path": "/usr/bin/net-setup", "args": ["net-setup", "up"], "timeout": 5 } ],
            "poststop": [ { "path": "/usr/bin/net-setup" } ]
        }"#;
        let hooks: Hooks = serde_json::from_str(json).unwrap();
        let create: Vec<_> = at(&hooks, HookPoint::CreateRuntime).collect();
        assert_eq!(create[0].timeout(), Some(5));
        assert_eq!(at(&hooks, HookPoint::Poststop).count(), 1);
        assert!(validate(&hooks).is_ok());
        assert!(!is_empty(&hooks));
        assert!(is_empty(&Hooks::default()));
    }

    #[test]
    fn only_late_points_tolerate_failure() {
        assert!(HookPoint::CreateRuntime.is_fatal());
        assert!(HookPoint::StartContainer.is_fatal());
        assert!(!HookPoint::Poststart.is_fatal());
        assert!(!HookPoint::Poststop.is_fatal());
    }
}
