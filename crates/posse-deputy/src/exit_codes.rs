//! Process exit codes for the deputy binary.
//!
//! These are a stable contract: sheriff-side tooling distinguishes a
//! clean shutdown from an identity conflict without parsing logs.

/// Exit codes for the deputy process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean shutdown after SIGINT/SIGTERM.
    Clean = 0,

    /// OS or bus initialization failure, or another deputy with the
    /// same id (different nonce) seen during discovery.
    OsError = 1,

    /// A deputy info message with our id arrived during discovery:
    /// an established deputy already owns the name.
    DuplicateDeputy = 2,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> ExitCode {
        match code {
            0 => ExitCode::Clean,
            2 => ExitCode::DuplicateDeputy,
            _ => ExitCode::OsError,
        }
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::OsError => "ERR_OS",
            ExitCode::DuplicateDeputy => "ERR_DUPLICATE_DEPUTY",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_stable() {
        assert_eq!(ExitCode::Clean.as_i32(), 0);
        assert_eq!(ExitCode::OsError.as_i32(), 1);
        assert_eq!(ExitCode::DuplicateDeputy.as_i32(), 2);
        assert_eq!(ExitCode::from_i32(2), ExitCode::DuplicateDeputy);
    }
}
