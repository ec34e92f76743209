//! Worker environment composition.
//!
//! Sources, later ones winning:
//! 1. allow-listed variables of the daemon's own environment
//! 2. the workspace env files, in configured order
//! 3. the port file written for this execution
//! 4. the port variables
//! 5. the execution identity variables

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::domain::models::{ExecutionId, PortPair};

pub const PORT_VAR: &str = "DROVER_PORT";
pub const SECONDARY_PORT_VAR: &str = "DROVER_SECONDARY_PORT";
pub const EXECUTION_ID_VAR: &str = "DROVER_EXECUTION_ID";
pub const WORKSPACE_VAR: &str = "DROVER_WORKSPACE";

/// Parse dotenv-style `KEY=VALUE` text.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is
/// accepted and matching single or double quotes around the value are
/// removed.
pub fn parse_env_file(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Contents of the port file for `ports`.
pub fn render_port_file(ports: PortPair) -> String {
    format!(
        "{PORT_VAR}={}\n{SECONDARY_PORT_VAR}={}\nPORT={}\n",
        ports.primary, ports.secondary, ports.primary
    )
}

/// Inputs for one worker environment.
#[derive(Debug, Clone)]
pub struct EnvLayers<'a> {
    pub allowlist: &'a [String],
    pub env_files: &'a [String],
    pub port_file: &'a str,
    pub workspace: &'a Path,
    pub ports: PortPair,
    pub execution_id: &'a ExecutionId,
}

/// Build the complete child environment from `ambient` and `layers`.
pub fn compose<I>(ambient: I, layers: &EnvLayers<'_>) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = ambient
        .into_iter()
        .filter(|(key, _)| layers.allowlist.iter().any(|allowed| allowed == key))
        .collect();

    let files = layers
        .env_files
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(layers.port_file));
    for name in files {
        let path = layers.workspace.join(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let vars = parse_env_file(&text);
                debug!(file = %path.display(), count = vars.len(), "loaded env file");
                env.extend(vars);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(file = %path.display(), error = %err, "unreadable env file skipped"),
        }
    }

    env.insert(PORT_VAR.to_string(), layers.ports.primary.to_string());
    env.insert(SECONDARY_PORT_VAR.to_string(), layers.ports.secondary.to_string());
    env.insert("PORT".to_string(), layers.ports.primary.to_string());

    env.insert(EXECUTION_ID_VAR.to_string(), layers.execution_id.to_string());
    env.insert(
        WORKSPACE_VAR.to_string(),
        layers.workspace.display().to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_env_file() {
        let vars = parse_env_file(
            "# comment\n\nexport A=1\nB = \"two words\"\nC='x'\nbroken line\n=novalue\nD=\n",
        );
        assert_eq!(
            vars,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
                ("C".to_string(), "x".to_string()),
                ("D".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_precedence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "SHARED=env\nDB=local\nPORT=1\n").unwrap();
        std::fs::write(dir.path().join(".env.local"), "SHARED=local\n").unwrap();
        std::fs::write(dir.path().join(".env.ports"), "DROVER_EXECUTION_ID=spoofed\n").unwrap();

        let allowlist = vec!["PATH".to_string(), "SHARED".to_string()];
        let env_files = vec![".env".to_string(), ".env.local".to_string()];
        let id = ExecutionId::parse("a1b2c3d4").unwrap();
        let layers = EnvLayers {
            allowlist: &allowlist,
            env_files: &env_files,
            port_file: ".env.ports",
            workspace: dir.path(),
            ports: PortPair {
                primary: 4107,
                secondary: 5107,
            },
            execution_id: &id,
        };
        let ambient = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("SHARED".to_string(), "ambient".to_string()),
            ("SECRET_TOKEN".to_string(), "leak".to_string()),
        ];

        let env = compose(ambient, &layers);
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["SHARED"], "local");
        assert_eq!(env["DB"], "local");
        assert_eq!(env["PORT"], "4107");
        assert_eq!(env[SECONDARY_PORT_VAR], "5107");
        assert_eq!(env[EXECUTION_ID_VAR], "a1b2c3d4");
        assert!(!env.contains_key("SECRET_TOKEN"));
    }

    #[test]
    fn test_render_port_file_round_trips() {
        let text = render_port_file(PortPair {
            primary: 4100,
            secondary: 5100,
        });
        let vars = parse_env_file(&text);
        assert!(vars.contains(&("PORT".to_string(), "4100".to_string())));
        assert!(vars.contains(&(SECONDARY_PORT_VAR.to_string(), "5100".to_string())));
    }
}
