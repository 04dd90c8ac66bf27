//! Builds a PEP 508 marker environment for each build [`Target`], binding
//! the handful of variables spec.md §4.3 assigns meaning to and filling the
//! remaining standard PEP 508 variables with fixed, conservative constants
//! that no marker in the wild distinguishes on for a *built-wheel* mirror
//! (platform_release, platform_version, and friends vary per-machine even
//! within one platform tag, so there is no single correct value -- we pick
//! one that never makes a marker spuriously unreachable).

use pep440_rs::StringVersion;
use pep508_rs::MarkerEnvironment;
use wheelhouse_tags::Target;

/// Build the [`MarkerEnvironment`] spec.md §4.3 describes for a single
/// target: `python_version`, `python_full_version = python_version + ".0"`,
/// `sys_platform`, `os_name`, `platform_system`, `implementation_name =
/// "cpython"`, `platform_machine = ""`. `extra` is bound separately at
/// evaluation time (we never resolve extras, so it is always absent).
pub fn marker_environment(target: &Target) -> Option<MarkerEnvironment> {
    let python_full_version = format!("{}.0", target.runtime_version);
    let python_version = StringVersion::from_str(&target.runtime_version).ok()?;
    let python_full_version = StringVersion::from_str(&python_full_version).ok()?;

    let (sys_platform, os_name, platform_system) = platform_bindings(&target.platform);

    Some(MarkerEnvironment {
        implementation_name: "cpython".to_string(),
        implementation_version: python_full_version.clone(),
        os_name: os_name.to_string(),
        platform_machine: String::new(),
        platform_python_implementation: "CPython".to_string(),
        platform_release: String::new(),
        platform_system: platform_system.to_string(),
        platform_version: String::new(),
        python_full_version,
        python_version,
        sys_platform: sys_platform.to_string(),
    })
}

/// `sys_platform` / `os_name` / `platform_system` for a platform tag, per
/// spec.md §4.3: `"linux"` / `"win32"` / `"darwin"` / pass-through.
fn platform_bindings(platform: &str) -> (&'static str, &'static str, &'static str) {
    if platform.starts_with("win") {
        ("win32", "nt", "Windows")
    } else if platform.starts_with("macosx") {
        ("darwin", "posix", "Darwin")
    } else if platform.starts_with("linux")
        || platform.starts_with("manylinux")
        || platform.starts_with("musllinux")
    {
        ("linux", "posix", "Linux")
    } else {
        // Pass-through: an unrecognized platform tag still gets a
        // `sys_platform` binding, it just isn't one of the three well-known
        // ones.
        ("", "posix", "")
    }
}

use std::str::FromStr;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_bindings() {
        let env = marker_environment(&Target::new("3.12", "linux_x86_64")).unwrap();
        assert_eq!(env.sys_platform.to_string(), "linux");
        assert_eq!(env.os_name.to_string(), "posix");
    }

    #[test]
    fn windows_bindings() {
        let env = marker_environment(&Target::new("3.12", "win_amd64")).unwrap();
        assert_eq!(env.sys_platform.to_string(), "win32");
        assert_eq!(env.os_name.to_string(), "nt");
    }

    #[test]
    fn macos_bindings() {
        let env = marker_environment(&Target::new("3.12", "macosx_11_0_arm64")).unwrap();
        assert_eq!(env.sys_platform.to_string(), "darwin");
    }
}
