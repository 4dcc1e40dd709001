//! `manifest.json` parsing, plugin discovery, and plugin-name checks.

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

use crate::ipc::protocol::PROTOCOL_VERSION;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION_SUPPORTED: u64 = 1;
pub const RESERVED_FUNCTION_PREFIX: &str = "rise_";
pub const DEFAULT_DESCRIPTION: &str = "No description provided.";

const PLUGIN_NAME_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9_-]*$";
const RESERVED_NAMES: &[&str] = &["con", "prn", "aux", "nul", "com1", "com2", "lpt1", "lpt2"];

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read manifest {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unsupported protocol_version '{0}' (expected '2.0')")]
    UnsupportedProtocol(String),
    #[error("unsupported manifest version {0} (expected 1)")]
    UnsupportedVersion(u64),
    #[error("manifest missing both 'schema' and 'functions'")]
    MissingFunctions,
    #[error("function entry missing 'name'")]
    FunctionMissingName,
    #[error("function '{0}' missing 'description'")]
    FunctionMissingDescription(String),
    #[error("function '{0}' uses reserved 'rise_' prefix")]
    ReservedPrefix(String),
    #[error("invalid plugin name '{name}': {reason}")]
    InvalidPluginName { name: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDefinition {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub required: bool,
    pub enum_values: Option<Vec<String>>,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterDefinition>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    /// Directory name, which is what the engine calls the plugin.
    pub name: String,
    pub description: String,
    pub directory: PathBuf,
    pub executable: String,
    pub executable_path: PathBuf,
    pub manifest_version: u64,
    pub protocol_version: String,
    pub persistent: bool,
    pub passthrough: bool,
    pub functions: Vec<FunctionDefinition>,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(rename = "manifestVersion")]
    manifest_version: Option<u64>,
    executable: Option<String>,
    persistent: Option<bool>,
    protocol_version: Option<Value>,
    description: Option<String>,
    #[serde(default)]
    passthrough: bool,
    #[serde(default)]
    tags: Value,
    functions: Option<Value>,
    schema: Option<Value>,
}

impl PluginManifest {
    /// Parse `<dir>/manifest.json`.
    pub fn load_dir(dir: &Path) -> Result<Self, ManifestError> {
        Self::load(&dir.join(MANIFEST_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, directory)
    }

    /// Parse manifest text for a plugin living in `directory`.
    pub fn parse(content: &str, directory: &Path) -> Result<Self, ManifestError> {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let raw: RawManifest = serde_json::from_str(content)?;

        let manifest_version = raw
            .manifest_version
            .ok_or(ManifestError::MissingField("manifestVersion"))?;
        let executable = raw
            .executable
            .ok_or(ManifestError::MissingField("executable"))?;
        let persistent = raw
            .persistent
            .ok_or(ManifestError::MissingField("persistent"))?;

        let protocol_version = match raw.protocol_version {
            None => return Err(ManifestError::MissingField("protocol_version")),
            Some(Value::String(version)) if version == PROTOCOL_VERSION => version,
            Some(Value::String(other)) => return Err(ManifestError::UnsupportedProtocol(other)),
            Some(other) => return Err(ManifestError::UnsupportedProtocol(other.to_string())),
        };
        if manifest_version != MANIFEST_VERSION_SUPPORTED {
            return Err(ManifestError::UnsupportedVersion(manifest_version));
        }

        let functions = parse_functions(raw.functions.as_ref(), raw.schema.as_ref())?;
        if let Some(reserved) = functions
            .iter()
            .find(|f| f.name.starts_with(RESERVED_FUNCTION_PREFIX))
        {
            return Err(ManifestError::ReservedPrefix(reserved.name.clone()));
        }

        // Passthrough only makes sense for a plugin with one entry point.
        let passthrough = raw.passthrough && functions.len() == 1;

        let name = directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            name,
            description: raw
                .description
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            directory: directory.to_path_buf(),
            executable_path: directory.join(&executable),
            executable,
            manifest_version,
            protocol_version,
            persistent,
            passthrough,
            functions,
            tags: string_list(&raw.tags),
        })
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }
}

// ============================================================================
// Function Definitions
// ============================================================================

fn parse_functions(
    functions: Option<&Value>,
    schema: Option<&Value>,
) -> Result<Vec<FunctionDefinition>, ManifestError> {
    let parsed = match (schema, functions) {
        (Some(Value::Object(schema)), _) => functions_from_schema(schema),
        (_, Some(Value::Array(entries))) => entries
            .iter()
            .filter_map(Value::as_object)
            .map(FunctionDefinition::from_object)
            .collect(),
        _ => return Err(ManifestError::MissingFunctions),
    };

    for function in &parsed {
        if function.name.is_empty() {
            return Err(ManifestError::FunctionMissingName);
        }
        if function.description.is_empty() {
            return Err(ManifestError::FunctionMissingDescription(
                function.name.clone(),
            ));
        }
    }
    Ok(parsed)
}

fn functions_from_schema(schema: &Map<String, Value>) -> Vec<FunctionDefinition> {
    let variants = schema
        .get("anyOf")
        .or_else(|| schema.get("oneOf"))
        .and_then(Value::as_array);
    if let Some(variants) = variants {
        return variants
            .iter()
            .filter_map(Value::as_object)
            .filter_map(schema_function)
            .collect();
    }
    if schema.contains_key("properties") {
        return schema_function(schema).into_iter().collect();
    }
    schema
        .iter()
        .filter_map(|(name, definition)| {
            let definition = definition.as_object()?;
            if !definition.contains_key("description") {
                return None;
            }
            let mut function = FunctionDefinition::from_object(definition);
            function.name = name.clone();
            Some(function)
        })
        .collect()
}

/// One `anyOf`/`oneOf` entry, optionally wrapped as `{"function": {...}}`.
fn schema_function(item: &Map<String, Value>) -> Option<FunctionDefinition> {
    let mut name = str_field(item, "name")
        .or_else(|| str_field(item, "title"))
        .unwrap_or_default();
    let mut description = str_field(item, "description").unwrap_or_default();
    let mut body = item;
    if let Some(inner) = item.get("function").and_then(Value::as_object) {
        name = str_field(inner, "name").unwrap_or(name);
        description = str_field(inner, "description").unwrap_or(description);
        body = inner;
    }
    if name.is_empty() {
        return None;
    }
    let mut function = FunctionDefinition::from_object(body);
    function.name = name;
    function.description = description;
    Some(function)
}

impl FunctionDefinition {
    fn from_object(object: &Map<String, Value>) -> Self {
        let mut parameters = Vec::new();
        if let Some(schema) = object.get("parameters").and_then(Value::as_object) {
            let required = schema.get("required").map(string_list).unwrap_or_default();
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (name, property) in properties {
                    parameters.push(ParameterDefinition::from_property(
                        name,
                        property,
                        required.contains(name),
                    ));
                }
            }
        }
        Self {
            name: str_field(object, "name").unwrap_or_default(),
            description: str_field(object, "description").unwrap_or_default(),
            parameters,
            tags: object.get("tags").map(string_list).unwrap_or_default(),
        }
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.parameters.iter().filter(|p| p.required)
    }
}

impl ParameterDefinition {
    fn from_property(name: &str, property: &Value, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: property
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("string")
                .to_string(),
            description: property
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            required,
            enum_values: property.get("enum").map(string_list),
            default: property.get("default").cloned(),
        }
    }
}

fn str_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Discovery
// ============================================================================

/// Sorted names of subdirectories of `plugins_dir` that hold a manifest.
pub fn discover_plugins(plugins_dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %plugins_dir.display(), "cannot scan plugins directory: {err}");
            return Vec::new();
        }
    };
    let mut plugins: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    plugins.sort();
    plugins
}

/// Accept names that are safe to join onto the plugins directory.
pub fn validate_plugin_name(name: &str) -> Result<(), ManifestError> {
    let reject = |reason| {
        Err(ManifestError::InvalidPluginName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return reject("name is empty");
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return reject("path separators are not allowed");
    }
    if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return reject("reserved device name");
    }

    static NAME_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    match NAME_RE.get_or_init(|| Regex::new(PLUGIN_NAME_PATTERN)) {
        Ok(re) if re.is_match(name) => Ok(()),
        Ok(_) => reject("must start with a letter and contain only letters, digits, '_' or '-'"),
        Err(_) => reject("name pattern unavailable"),
    }
}
