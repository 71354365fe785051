//! Terminal output for the CLI
//!
//! Interactive terminals get `cliclack` styling and an `indicatif`
//! progress bar; CI and piped output get plain bracketed lines.
//!
//! ```rust,ignore
//! use strata::ui::{self, UiContext};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "strata build");
//! ui::step_ok_detail(&ctx, "Image built", "3f9a1c0d2e4b");
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, outro_error, outro_success, outro_warn, remark, section, step_error_detail,
    step_info, step_ok, step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::{BuildProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, StrataTheme};
