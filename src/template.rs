use minijinja::{Environment, UndefinedBehavior};
use thiserror::Error;

/// Value returned by the placeholder `httpPathPrefix` used when validating templates
pub const DUMMY_HTTP_PATH_PREFIX: &str = "DUMMY_HTTP_PATH_PREFIX";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Syntax(#[source] minijinja::Error),

    #[error("template render error: {0}")]
    Render(#[source] minijinja::Error),
}

/// HTTP path under which a Workspace port is reachable through layer 7 routing
pub fn connect_path(namespace: &str, workspace: &str, port_id: &str) -> String {
    format!("/workspace/{namespace}/{workspace}/{port_id}/")
}

/// Render an env value or header value template.
///
/// The only callable available to templates is `httpPathPrefix(portId)`, e.g.
/// `{{ httpPathPrefix("jupyterlab") }}`. Undefined names are errors.
pub fn render<F>(template: &str, http_path_prefix: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_function("httpPathPrefix", move |port_id: String| -> String {
        http_path_prefix(&port_id)
    });

    let tmpl = env
        .template_from_str(template)
        .map_err(TemplateError::Syntax)?;
    tmpl.render(()).map_err(TemplateError::Render)
}

/// Check that a template parses and renders without a live Workspace
pub fn validate(template: &str) -> Result<(), TemplateError> {
    render(template, |_| DUMMY_HTTP_PATH_PREFIX.to_string()).map(|_| ())
}
