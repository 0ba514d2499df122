//! Fixed pytest boilerplate written before the generating call.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, info};

use crate::io::artifacts::write_atomic;

const CONFTEST_TEMPLATE: &str = include_str!("skeleton/conftest.py.j2");
const PYTEST_INI: &str = include_str!("skeleton/pytest.ini");
const REQUIREMENTS_TXT: &str = include_str!("skeleton/requirements.txt");

/// Target environment baked into `conftest.py`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    /// Per-request timeout used by the `api` fixture.
    pub request_timeout_secs: u64,
}

/// Write `conftest.py`, `pytest.ini` and `requirements.txt` into `tests_dir`.
///
/// Existing files are left alone so agent edits survive a resumed task.
/// Returns the files actually written.
pub fn write_skeleton(tests_dir: &Path, env: &EnvConfig) -> Result<Vec<PathBuf>> {
    let conftest = render_conftest(env)?;
    let files = [
        ("conftest.py", conftest.as_str()),
        ("pytest.ini", PYTEST_INI),
        ("requirements.txt", REQUIREMENTS_TXT),
    ];
    let mut written = Vec::new();
    for (name, contents) in files {
        let path = tests_dir.join(name);
        if path.exists() {
            debug!(path = %path.display(), "skeleton file exists, keeping it");
            continue;
        }
        write_atomic(&path, contents.as_bytes())?;
        written.push(path);
    }
    info!(written = written.len(), "wrote test skeleton");
    Ok(written)
}

fn render_conftest(env: &EnvConfig) -> Result<String> {
    let mut jinja = Environment::new();
    jinja
        .add_template("conftest.py", CONFTEST_TEMPLATE)
        .context("load conftest template")?;
    let token = env
        .auth_token
        .as_deref()
        .map(sanitize_token)
        .unwrap_or_default();
    let mut rendered = jinja
        .get_template("conftest.py")?
        .render(context! {
            base_url => python_string(&env.base_url),
            auth_token => python_string(&token),
            timeout => env.request_timeout_secs,
        })
        .context("render conftest.py")?;
    rendered.push('\n');
    Ok(rendered)
}

/// Keep printable ASCII only; tokens pasted from terminals often carry stray bytes.
pub fn sanitize_token(token: &str) -> String {
    token
        .trim()
        .chars()
        .filter(|c| c.is_ascii_graphic())
        .collect()
}

/// Double-quoted Python string literal.
fn python_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
