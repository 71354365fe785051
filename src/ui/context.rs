//! Output mode detection

use std::io::IsTerminal;

/// Environment variables set by common CI systems
const CI_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// How the CLI should talk to the terminal
#[derive(Debug, Clone)]
pub struct UiContext {
    interactive: bool,
    auto_yes: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        Self {
            interactive: detect_interactive(),
            auto_yes: false,
        }
    }

    /// A context that never prompts or animates
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
        }
    }

    /// Machine-readable output (`--format json|plain`) must stay clean
    pub fn for_machine_output(mut self, machine: bool) -> Self {
        if machine {
            self.interactive = false;
        }
        self
    }

    /// Approve prompts without asking (`--yes`)
    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Spinners, progress bars and `cliclack` framing
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }
}

fn detect_interactive() -> bool {
    std::io::stdout().is_terminal()
        && std::io::stdin().is_terminal()
        && !CI_VARS.iter().any(|var| std::env::var_os(var).is_some())
}
