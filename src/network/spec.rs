//! Model config parsing
//!
//! A model config is a sectioned `key=value` text file describing the layer
//! stack, one block per section:
//!
//! ```text
//! [net]
//! channels=3
//!
//! [convolutional]
//! filters=16
//! size=3
//! stride=1
//! activation=relu
//!
//! [maxpool]
//! size=2
//! stride=2
//!
//! [connected]
//! output=classes
//! activation=linear
//! ```
//!
//! The parser only checks the file's shape; layer-level validation happens
//! when the network is built from the spec.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Section names the network factory understands.
const KNOWN_SECTIONS: &[&str] = &["net", "convolutional", "maxpool", "connected"];

/// One `[section]` of a model config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Section name, e.g. `convolutional`
    pub kind: String,
    /// Key/value pairs inside the section
    pub params: HashMap<String, String>,
}

impl Block {
    /// Fetch a required key.
    pub fn param(&self, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::config(format!("[{}] is missing key `{}`", self.kind, key)))
    }

    /// Fetch a required key as usize.
    pub fn usize_param(&self, key: &str) -> Result<usize> {
        let raw = self.param(key)?;
        raw.parse().map_err(|_| {
            Error::config(format!("[{}] key `{}` is not an integer: {}", self.kind, key, raw))
        })
    }

    /// Fetch an optional key as usize, falling back to `default`.
    pub fn usize_param_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.params.get(key) {
            None => Ok(default),
            Some(_) => self.usize_param(key),
        }
    }
}

/// Parsed model config: an ordered list of layer blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Blocks in file order
    pub blocks: Vec<Block>,
}

impl NetworkSpec {
    /// Parse a model config file. A missing or unreadable file is a
    /// configuration error, not an IO error, since the run cannot proceed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read model config {}: {}", path.display(), e))
        })?;
        Self::from_str(&text)
    }

    /// Parse model config text.
    pub fn from_str(text: &str) -> Result<Self> {
        let mut blocks: Vec<Block> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let kind = name.trim().to_lowercase();
                if !KNOWN_SECTIONS.contains(&kind.as_str()) {
                    return Err(Error::config(format!(
                        "unknown section [{}] at line {}",
                        kind,
                        lineno + 1
                    )));
                }
                blocks.push(Block {
                    kind,
                    params: HashMap::new(),
                });
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::config(format!("expected `key=value` at line {}: {}", lineno + 1, line))
            })?;
            let block = blocks.last_mut().ok_or_else(|| {
                Error::config(format!("`{}` appears before any section at line {}", key, lineno + 1))
            })?;
            block
                .params
                .insert(key.trim().to_lowercase(), value.trim().to_string());
        }

        let spec = Self { blocks };
        if spec.layer_blocks().next().is_none() {
            return Err(Error::config("model config defines no layers"));
        }
        Ok(spec)
    }

    /// Input channel count, from the optional `[net]` header. Defaults to RGB.
    pub fn in_channels(&self) -> Result<usize> {
        match self.blocks.first() {
            Some(block) if block.kind == "net" => block.usize_param_or("channels", 3),
            _ => Ok(3),
        }
    }

    /// Iterate over the layer blocks, skipping the `[net]` header.
    pub fn layer_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.kind != "net")
    }
}
