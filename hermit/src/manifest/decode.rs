//! Typed decoding of manifest HCL into the [`Manifest`] schema.
//!
//! `hcl::parse` materializes the AST; this module walks it and produces
//! [`Layer`]s. Values written as interpolated strings (`"${root}/bin"`) are
//! recovered verbatim; hermit performs its own `${...}` substitution much
//! later, at package materialization and activation time.

use camino::Utf8Path;
use hcl::{Block, Body, Expression, ObjectKey};

use crate::errors::{HermitError, HermitResult};
use crate::manifest::actions::{Action, Event};
use crate::manifest::reference::Version;
use crate::manifest::{ChannelBlock, Layer, Manifest, PlatformBlock, VersionBlock};

/// Parse and decode one manifest file
pub fn parse_manifest(path: &Utf8Path, text: &str) -> HermitResult<Manifest> {
    let body = hcl::parse(text).map_err(|cause| HermitError::ManifestParse {
        path: path.to_owned(),
        cause: Box::new(cause),
    })?;
    Decoder { path }.manifest(&body)
}

struct Decoder<'a> {
    path: &'a Utf8Path,
}

impl<'a> Decoder<'a> {
    fn invalid(&self, message: impl std::fmt::Display) -> HermitError {
        HermitError::ManifestValidation { path: self.path.to_owned(), message: message.to_string() }
    }

    fn manifest(&self, body: &Body) -> HermitResult<Manifest> {
        let mut description = String::new();
        for attr in body.attributes() {
            if attr.key() == "description" {
                description = self.string(attr.key(), attr.expr())?;
            }
        }

        let layer = self.layer(body, &["description"])?;
        let mut platforms = Vec::new();
        let mut versions = Vec::new();
        let mut channels = Vec::new();

        for block in body.blocks() {
            match block.identifier() {
                "on" => {} // consumed by layer()
                "platform" | "darwin" | "linux" => {
                    platforms.push(self.platform_block(block)?);
                }
                "version" => versions.push(self.version_block(block)?),
                "channel" => channels.push(self.channel_block(block)?),
                other => return Err(self.invalid(format!("unknown block {other:?}"))),
            }
        }

        if versions.is_empty() && channels.is_empty() {
            return Err(self.invalid("manifest must declare at least one version or channel"));
        }

        Ok(Manifest { description, layer, platforms, versions, channels })
    }

    /// Decode the attributes and `on` blocks of a body into a [`Layer`].
    /// `extra` names caller-owned attributes to skip.
    fn layer(&self, body: &Body, extra: &[&str]) -> HermitResult<Layer> {
        let mut layer = Layer::default();
        for attr in body.attributes() {
            let key = attr.key();
            let expr = attr.expr();
            match key {
                "binaries" => layer.binaries = self.string_list(key, expr)?,
                "apps" => layer.apps = self.string_list(key, expr)?,
                "requires" => layer.requires = self.string_list(key, expr)?,
                "runtime-dependencies" => {
                    layer.runtime_dependencies = self.string_list(key, expr)?
                }
                "provides" => layer.provides = self.string_list(key, expr)?,
                "env" => layer.env = self.string_pairs(key, expr)?,
                "sha256-sums" => {
                    layer.sha256_sums = self.string_pairs(key, expr)?.into_iter().collect()
                }
                "source" => layer.source = Some(self.string(key, expr)?),
                "mirrors" => layer.mirrors = self.string_list(key, expr)?,
                "sha256" => layer.sha256 = Some(self.string(key, expr)?),
                "dont-extract" => layer.dont_extract = Some(self.boolean(key, expr)?),
                "mutable" => layer.mutable = Some(self.boolean(key, expr)?),
                "strip" => layer.strip = Some(self.integer(key, expr)? as usize),
                "test" => layer.test = Some(self.string(key, expr)?),
                "files" => layer.files = self.string_pairs(key, expr)?.into_iter().collect(),
                _ if extra.contains(&key) => {}
                other => return Err(self.invalid(format!("unknown attribute {other:?}"))),
            }
        }
        for block in body.blocks() {
            if block.identifier() == "on" {
                let (event, actions) = self.trigger_block(block)?;
                layer.triggers.entry(event).or_default().extend(actions);
            }
        }
        Ok(layer)
    }

    fn platform_block(&self, block: &Block) -> HermitResult<PlatformBlock> {
        // `darwin { ... }` and `linux { ... }` are sugar for
        // `platform darwin { ... }` etc.
        let mut attrs: Vec<String> = match block.identifier() {
            "platform" => Vec::new(),
            os => vec![os.to_string()],
        };
        attrs.extend(block.labels().iter().map(|l| l.as_str().to_string()));
        if attrs.is_empty() {
            return Err(self.invalid("platform block requires at least one os/arch attribute"));
        }
        let layer = self.layer(block.body(), &[])?;
        Ok(PlatformBlock { attrs, layer })
    }

    fn version_block(&self, block: &Block) -> HermitResult<VersionBlock> {
        let versions: Vec<Version> =
            block.labels().iter().map(|l| Version::new(l.as_str())).collect();
        if versions.is_empty() {
            return Err(self.invalid("version block requires at least one version label"));
        }
        let layer = self.layer(block.body(), &[])?;
        let mut platforms = Vec::new();
        for nested in block.body().blocks() {
            match nested.identifier() {
                "on" => {}
                "platform" | "darwin" | "linux" => platforms.push(self.platform_block(nested)?),
                other => {
                    return Err(self.invalid(format!("unknown block {other:?} in version block")))
                }
            }
        }
        Ok(VersionBlock { versions, layer, platforms })
    }

    fn channel_block(&self, block: &Block) -> HermitResult<ChannelBlock> {
        let labels = block.labels();
        if labels.len() != 1 {
            return Err(self.invalid("channel block requires exactly one name label"));
        }
        let name = labels[0].as_str().to_string();
        let mut update = None;
        let mut version = None;
        for attr in block.body().attributes() {
            match attr.key() {
                "update" => {
                    let text = self.string(attr.key(), attr.expr())?;
                    let duration = humantime::parse_duration(&text).map_err(|err| {
                        self.invalid(format!("channel {name}: bad update interval {text:?}: {err}"))
                    })?;
                    update = Some(duration);
                }
                "version" => version = Some(self.string(attr.key(), attr.expr())?),
                _ => {}
            }
        }
        let layer = self.layer(block.body(), &["update", "version"])?;
        Ok(ChannelBlock { name, update, version, layer })
    }

    fn trigger_block(&self, block: &Block) -> HermitResult<(Event, Vec<Action>)> {
        let labels = block.labels();
        if labels.len() != 1 {
            return Err(self.invalid("on block requires exactly one event label"));
        }
        let event: Event = labels[0].as_str().parse()?;
        let mut actions = Vec::new();
        for action in block.body().blocks() {
            actions.push(self.action(action)?);
        }
        Ok((event, actions))
    }

    fn action(&self, block: &Block) -> HermitResult<Action> {
        let body = block.body();
        match block.identifier() {
            "run" => Ok(Action::Run {
                command: self.required_string(body, "run", "command")?,
                args: self.optional_string_list(body, "args")?,
                env: self.optional_string_list(body, "env")?,
                dir: self.optional_string(body, "dir")?,
                stdin: self.optional_string(body, "stdin")?,
            }),
            "copy" => Ok(Action::Copy {
                from: self.required_string(body, "copy", "from")?,
                to: self.required_string(body, "copy", "to")?,
                mode: self.optional_mode(body)?,
            }),
            "rename" => Ok(Action::Rename {
                from: self.required_string(body, "rename", "from")?,
                to: self.required_string(body, "rename", "to")?,
            }),
            "symlink" => Ok(Action::Symlink {
                from: self.required_string(body, "symlink", "from")?,
                to: self.required_string(body, "symlink", "to")?,
            }),
            "mkdir" => Ok(Action::Mkdir {
                dir: self.required_string(body, "mkdir", "dir")?,
                mode: self.optional_mode(body)?,
            }),
            "chmod" => {
                let mode = self
                    .optional_mode(body)?
                    .ok_or_else(|| self.invalid("chmod action requires a mode"))?;
                Ok(Action::Chmod { file: self.required_string(body, "chmod", "file")?, mode })
            }
            "message" => {
                Ok(Action::Message { text: self.required_string(body, "message", "text")? })
            }
            "delete" => {
                let mut recursive = false;
                let mut files = Vec::new();
                for attr in body.attributes() {
                    match attr.key() {
                        "recursive" => recursive = self.boolean("recursive", attr.expr())?,
                        "file" | "files" => {
                            files = self.string_list(attr.key(), attr.expr())?;
                        }
                        other => {
                            return Err(
                                self.invalid(format!("unknown delete attribute {other:?}"))
                            )
                        }
                    }
                }
                Ok(Action::Delete { recursive, files })
            }
            other => Err(self.invalid(format!("unknown action {other:?}"))),
        }
    }

    fn optional_string(&self, body: &Body, key: &str) -> HermitResult<Option<String>> {
        for attr in body.attributes() {
            if attr.key() == key {
                return Ok(Some(self.string(key, attr.expr())?));
            }
        }
        Ok(None)
    }

    fn required_string(&self, body: &Body, action: &str, key: &str) -> HermitResult<String> {
        self.optional_string(body, key)?
            .ok_or_else(|| self.invalid(format!("{action} action requires {key:?}")))
    }

    fn optional_string_list(&self, body: &Body, key: &str) -> HermitResult<Vec<String>> {
        for attr in body.attributes() {
            if attr.key() == key {
                return self.string_list(key, attr.expr());
            }
        }
        Ok(Vec::new())
    }

    /// Modes are written either as an octal string (`"0755"`) or an integer
    /// whose decimal digits read as octal (`755`).
    fn optional_mode(&self, body: &Body) -> HermitResult<Option<u32>> {
        for attr in body.attributes() {
            if attr.key() == "mode" {
                let text = match attr.expr() {
                    Expression::Number(n) => n.to_string(),
                    expr => self.string("mode", expr)?,
                };
                let digits = text.trim_start_matches("0o");
                let mode = u32::from_str_radix(digits, 8)
                    .map_err(|_| self.invalid(format!("invalid mode {text:?}")))?;
                return Ok(Some(mode));
            }
        }
        Ok(None)
    }

    fn string(&self, key: &str, expr: &Expression) -> HermitResult<String> {
        expr_string(expr).ok_or_else(|| self.invalid(format!("{key} must be a string")))
    }

    fn boolean(&self, key: &str, expr: &Expression) -> HermitResult<bool> {
        match expr {
            Expression::Bool(b) => Ok(*b),
            _ => Err(self.invalid(format!("{key} must be a bool"))),
        }
    }

    fn integer(&self, key: &str, expr: &Expression) -> HermitResult<i64> {
        match expr {
            Expression::Number(n) => n
                .as_i64()
                .ok_or_else(|| self.invalid(format!("{key} must be an integer"))),
            _ => Err(self.invalid(format!("{key} must be an integer"))),
        }
    }

    fn string_list(&self, key: &str, expr: &Expression) -> HermitResult<Vec<String>> {
        expr_string_list(expr)
            .ok_or_else(|| self.invalid(format!("{key} must be a list of strings")))
    }

    fn string_pairs(&self, key: &str, expr: &Expression) -> HermitResult<Vec<(String, String)>> {
        expr_string_pairs(expr)
            .ok_or_else(|| self.invalid(format!("{key} must be an object of strings")))
    }
}

/// Best-effort conversion of an expression to the string the author wrote.
/// Interpolated strings come back verbatim, `${...}` included; hermit does
/// its own substitution later.
pub(crate) fn expr_string(expr: &Expression) -> Option<String> {
    match expr {
        Expression::String(s) => Some(s.clone()),
        Expression::TemplateExpr(t) => {
            let t: &hcl::TemplateExpr = t;
            match t {
                hcl::TemplateExpr::QuotedString(s) => Some(s.clone()),
                _ => None,
            }
        }
        Expression::Number(n) => Some(n.to_string()),
        Expression::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Best-effort boolean conversion, shared with the env config decoder
pub(crate) fn expr_bool(expr: &Expression) -> Option<bool> {
    match expr {
        Expression::Bool(b) => Some(*b),
        _ => None,
    }
}

/// An array of strings; a lone string reads as a single-element list
pub(crate) fn expr_string_list(expr: &Expression) -> Option<Vec<String>> {
    match expr {
        Expression::Array(items) => items.iter().map(expr_string).collect(),
        _ => expr_string(expr).map(|s| vec![s]),
    }
}

/// An object expression as ordered `(key, value)` pairs
pub(crate) fn expr_string_pairs(expr: &Expression) -> Option<Vec<(String, String)>> {
    let Expression::Object(object) = expr else {
        return None;
    };
    let mut pairs = Vec::new();
    for (k, v) in object.iter() {
        let k = match k {
            ObjectKey::Identifier(ident) => ident.to_string(),
            ObjectKey::Expression(expr) => expr_string(expr)?,
            _ => return None,
        };
        pairs.push((k, expr_string(v)?));
    }
    Some(pairs)
}
