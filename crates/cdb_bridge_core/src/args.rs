use std::path::Path;

/// Builders for the command-line conventions cdb understands at startup.
/// The engine passes these through without interpreting them.
pub struct StartupArgs;

impl StartupArgs {
    pub fn attach_pid(pid: u32) -> Vec<String> {
        vec!["-p".to_string(), pid.to_string()]
    }

    pub fn attach_name(name: &str) -> Vec<String> {
        vec!["-pn".to_string(), name.to_string()]
    }

    pub fn open_dump(path: impl AsRef<Path>) -> Vec<String> {
        vec!["-z".to_string(), path.as_ref().to_string_lossy().into_owned()]
    }

    /// Used when a request carries no startup arguments.
    pub fn idle() -> Vec<String> {
        vec!["-p".to_string(), "-1".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_conventions() {
        assert_eq!(StartupArgs::attach_pid(4242), vec!["-p", "4242"]);
        assert_eq!(StartupArgs::attach_name("notepad.exe"), vec!["-pn", "notepad.exe"]);
        assert_eq!(
            StartupArgs::open_dump(r"C:\dumps\crash.dmp"),
            vec!["-z", r"C:\dumps\crash.dmp"]
        );
        assert_eq!(StartupArgs::idle(), vec!["-p", "-1"]);
    }
}
