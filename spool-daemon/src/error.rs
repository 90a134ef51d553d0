//! Exit-code mapping for the daemon binary.

use spool::daemon::DaemonError;

/// Clamps an errno-scale exit code into the u8 range the shell sees.
pub fn exit_code_of(err: &DaemonError) -> u8 {
    let code = err.exit_code();
    if (1..=255).contains(&code) {
        code as u8
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_pass_through() {
        assert_eq!(
            exit_code_of(&DaemonError::AlreadyRunning("held".into())),
            17
        );
        assert_eq!(exit_code_of(&DaemonError::Config("bad".into())), 1);
        assert_eq!(exit_code_of(&DaemonError::NoDevice), libc::ENXIO as u8);
    }
}
