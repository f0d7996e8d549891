//! Command-line entry point (SPEC_FULL.md §4.7, §6.3): the startup mode
//! matrix from §4.3 exposed as flags, mirroring `clap`'s derive API.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "webterm", version, about = "A host-resident POSIX-flavored terminal emulator core")]
pub struct Cli {
    /// Run this file as a script instead of starting interactively.
    pub script: Option<String>,

    /// Override the default `.profile` lookup.
    #[arg(long)]
    pub profile: Option<String>,

    /// Skip profile loading entirely.
    #[arg(long)]
    pub no_rc: bool,

    /// Override `HIST_SIZE` before any script/profile runs.
    #[arg(long)]
    pub hist_size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_positional_is_optional() {
        let cli = Cli::parse_from(["webterm"]);
        assert!(cli.script.is_none());
        assert!(!cli.no_rc);
    }

    #[test]
    fn script_and_flags_parse_together() {
        let cli = Cli::parse_from(["webterm", "setup.sh", "--hist-size", "50", "--no-rc"]);
        assert_eq!(cli.script.as_deref(), Some("setup.sh"));
        assert_eq!(cli.hist_size, Some(50));
        assert!(cli.no_rc);
    }

    #[test]
    fn profile_override_parses() {
        let cli = Cli::parse_from(["webterm", "--profile", "alt.profile"]);
        assert_eq!(cli.profile.as_deref(), Some("alt.profile"));
    }
}
