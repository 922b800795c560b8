//! Checks for the optional capture tools the tracker is usually paired with

use std::fmt;

/// Tools looked up on `PATH`, with a human-readable description.
const TOOLS: [(&str, &str); 3] = [
    ("mitmproxy", "mitmproxy (optional, for proxy sniffing)"),
    ("tcpdump", "tcpdump (optional, for packet capture)"),
    ("wireshark", "wireshark (optional, for deeper analysis)"),
];

/// A tool that could not be found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissingTool {
    /// Executable name looked up on `PATH`
    pub binary: &'static str,
    /// What the tool is used for
    pub description: &'static str,
}

/// Result of a prerequisite check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    /// Tools not found, in check order
    pub missing: Vec<MissingTool>,
}

/// Look up every known tool on `PATH`.
pub fn check() -> CheckResult {
    check_with(|binary| which::which(binary).is_ok())
}

/// Check every known tool with the given lookup.
///
/// Split apart to allow injecting the lookup for testing purposes.
fn check_with(mut is_installed: impl FnMut(&str) -> bool) -> CheckResult {
    let missing = TOOLS
        .iter()
        .filter(|&&(binary, _)| !is_installed(binary))
        .map(|&(binary, description)| MissingTool {
            binary,
            description,
        })
        .collect();
    CheckResult { missing }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.missing.is_empty() {
            return writeln!(f, "[+] All system prerequisites are present.");
        }
        writeln!(f, "[!] Some prerequisites are missing:")?;
        for tool in &self.missing {
            writeln!(f, "    - {} ({})", tool.description, tool.binary)?;
        }
        let names = self
            .missing
            .iter()
            .map(|tool| tool.binary)
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(f, "    Install with: sudo apt install {names}")
    }
}
