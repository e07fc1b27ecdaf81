//! Task template rendering.
//!
//! Templates use Jinja placeholders (`{{client}}`, `{{flag}}`). Undefined names are errors so a
//! typo never silently produces an empty field in a manifest.

use minijinja::{AutoEscape, Environment, UndefinedBehavior};

use crate::{EngineError, RenderVars};

const TEMPLATE_NAME: &str = "task";

/// Render `template` with `vars`. Syntax errors and unknown placeholders fail the whole render.
pub fn render(template: &str, vars: &RenderVars) -> Result<String, EngineError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.add_template(TEMPLATE_NAME, template)
        .map_err(|e| EngineError::Render(format!("parse: {}", e)))?;
    let tmpl = env
        .get_template(TEMPLATE_NAME)
        .map_err(|e| EngineError::Render(e.to_string()))?;
    tmpl.render(vars).map_err(|e| EngineError::Render(e.to_string()))
}
