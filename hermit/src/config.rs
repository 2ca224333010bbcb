//! The per-environment configuration file, `bin/hermit.hcl`.

use std::fs;

use camino::Utf8Path;

use crate::errors::{HermitError, HermitResult};
use crate::manifest::decode::{expr_bool, expr_string_list, expr_string_pairs};

/// Contents of `bin/hermit.hcl`
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    /// extra environment variables applied on activation
    pub env: Vec<(String, String)>,
    /// manifest source URIs; `None` inherits the global default
    pub sources: Option<Vec<String>>,
    /// whether to `git add -f` linked files in git-managed projects
    pub manage_git: bool,
    /// whether to materialize IntelliJ plugin configuration
    pub idea: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig { env: Vec::new(), sources: None, manage_git: true, idea: false }
    }
}

impl EnvConfig {
    /// Load the config from `bin/hermit.hcl`. A missing file yields the
    /// defaults; the environment still exists without one.
    pub fn load(path: &Utf8Path) -> HermitResult<EnvConfig> {
        match fs::read_to_string(path) {
            Ok(text) => EnvConfig::parse(path, &text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(EnvConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Parse config text
    pub fn parse(path: &Utf8Path, text: &str) -> HermitResult<EnvConfig> {
        let invalid = |message: String| HermitError::ManifestValidation {
            path: path.to_owned(),
            message,
        };
        let body = hcl::parse(text).map_err(|cause| HermitError::ManifestParse {
            path: path.to_owned(),
            cause: Box::new(cause),
        })?;
        let mut config = EnvConfig::default();
        for attr in body.attributes() {
            match attr.key() {
                "env" => {
                    config.env = expr_string_pairs(attr.expr())
                        .ok_or_else(|| invalid("env must be an object of strings".to_string()))?
                }
                "sources" => {
                    config.sources = Some(expr_string_list(attr.expr()).ok_or_else(|| {
                        invalid("sources must be a list of strings".to_string())
                    })?)
                }
                "manage-git" => {
                    config.manage_git = expr_bool(attr.expr())
                        .ok_or_else(|| invalid("manage-git must be a bool".to_string()))?
                }
                "idea" => {
                    config.idea = expr_bool(attr.expr())
                        .ok_or_else(|| invalid("idea must be a bool".to_string()))?
                }
                other => return Err(invalid(format!("unknown attribute {other:?}"))),
            }
        }
        Ok(config)
    }

    /// Render the config back to HCL text, writing only non-default fields
    pub fn to_hcl_string(&self) -> String {
        let mut out = String::new();
        if !self.env.is_empty() {
            out.push_str("env = {\n");
            for (key, value) in &self.env {
                out.push_str(&format!("  {key:?}: {value:?}\n"));
            }
            out.push_str("}\n");
        }
        if let Some(sources) = &self.sources {
            let quoted: Vec<String> = sources.iter().map(|s| format!("{s:?}")).collect();
            out.push_str(&format!("sources = [{}]\n", quoted.join(", ")));
        }
        if !self.manage_git {
            out.push_str("manage-git = false\n");
        }
        if self.idea {
            out.push_str("idea = true\n");
        }
        out
    }

    /// Set or replace one `env` override, preserving order for existing keys
    pub fn set_env(&mut self, key: &str, value: &str) {
        for pair in &mut self.env {
            if pair.0 == key {
                pair.1 = value.to_string();
                return;
            }
        }
        self.env.push((key.to_string(), value.to_string()));
    }

    /// Persist the config to `path`
    pub fn save(&self, path: &Utf8Path) -> HermitResult<()> {
        fs::write(path, self.to_hcl_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_roundtrip() {
        let text = r#"
env = {
  "FOO": "bar"
}
sources = ["https://github.com/cashapp/hermit-packages.git"]
manage-git = false
"#;
        let config = EnvConfig::parse(Utf8Path::new("hermit.hcl"), text).unwrap();
        assert_eq!(config.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(
            config.sources.as_deref(),
            Some(&["https://github.com/cashapp/hermit-packages.git".to_string()][..])
        );
        assert!(!config.manage_git);
        assert!(!config.idea);

        let rendered = config.to_hcl_string();
        let reparsed = EnvConfig::parse(Utf8Path::new("hermit.hcl"), &rendered).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn empty_config_is_default() {
        let config = EnvConfig::parse(Utf8Path::new("hermit.hcl"), "").unwrap();
        assert_eq!(config, EnvConfig::default());
        assert!(config.manage_git);
    }
}
