//! Vault document - the JSON tree stored inside the encrypted vault
//!
//! The root is a non-empty object. Every value is either a string (a field)
//! or another non-empty object (a group). Fields are addressed by joining
//! keys with `/`, e.g. `Work/GitLab/Password`. Keys starting with `_` are
//! hidden and only listed on request.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use zeroize::Zeroizing;

/// Separator between keys in a field path
pub const PATH_SEPARATOR: char = '/';

/// Prefix marking a key as hidden
pub const HIDDEN_PREFIX: char = '_';

/// Document-specific errors
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("could not decode the vault contents (expecting JSON)")]
    Decode(#[from] serde_json::Error),

    #[error("the vault root must be a JSON object")]
    NotAnObject,

    #[error("the object at {0:?} has no keys")]
    EmptyObject(String),

    #[error("the key {0:?} has a value that is neither an object nor a string")]
    InvalidValue(String),

    #[error("the key {0:?} must be non-empty and must not contain '/'")]
    InvalidKey(String),

    #[error("invalid field path: {0:?}")]
    InvalidPath(String),

    #[error("field not found: {0}")]
    NotFound(String),

    #[error("{0:?} is a group of fields, not a single field")]
    NotAField(String),

    #[error("{0:?} is a field, so it cannot contain other fields")]
    NotAGroup(String),

    #[error("removing {0:?} would leave the vault empty")]
    WouldEmpty(String),
}

/// Validated vault contents
#[derive(Debug, Clone, PartialEq)]
pub struct VaultDocument {
    root: Map<String, Value>,
}

impl VaultDocument {
    /// Parse and validate decrypted vault bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(root) = value else {
            return Err(DocumentError::NotAnObject);
        };
        validate_object(&root, "")?;
        Ok(Self { root })
    }

    /// Compact JSON, ready for encryption
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, DocumentError> {
        Ok(Zeroizing::new(serde_json::to_vec(&self.root)?))
    }

    /// Content written into a freshly created vault
    pub fn starter() -> Self {
        let value = serde_json::json!({
            "Personal": {
                "Email": {
                    "Address": "me@example.com",
                    "Password": "change-me"
                },
                "_Recovery Codes": {
                    "Primary": "0000-0000"
                }
            },
            "Work": {
                "GitLab": {
                    "URL": "gitlab.example.org",
                    "Username": "me",
                    "Password": "change-me"
                }
            }
        });
        match value {
            Value::Object(root) => Self { root },
            _ => unreachable!("starter document is an object literal"),
        }
    }

    /// All fields by path, sorted. Hidden fields only when asked for.
    pub fn fields(&self, include_hidden: bool) -> BTreeMap<String, &str> {
        let mut fields = BTreeMap::new();
        collect_fields(&self.root, "", include_hidden, &mut fields);
        fields
    }

    /// Value of one field
    pub fn get(&self, path: &str) -> Result<&str, DocumentError> {
        let keys = split_path(path)?;
        let (last, parents) = keys.split_last().ok_or_else(|| DocumentError::InvalidPath(path.to_string()))?;

        let mut current = &self.root;
        for key in parents {
            current = match current.get(*key) {
                Some(Value::Object(map)) => map,
                _ => return Err(DocumentError::NotFound(path.to_string())),
            };
        }

        match current.get(*last) {
            Some(Value::String(value)) => Ok(value),
            Some(_) => Err(DocumentError::NotAField(path.to_string())),
            None => Err(DocumentError::NotFound(path.to_string())),
        }
    }

    /// Set a field, creating intermediate groups as needed
    pub fn set(&mut self, path: &str, value: impl Into<String>) -> Result<(), DocumentError> {
        let keys = split_path(path)?;
        let (last, parents) = keys.split_last().ok_or_else(|| DocumentError::InvalidPath(path.to_string()))?;

        let mut current = &mut self.root;
        let mut walked = String::new();
        for key in parents {
            push_key(&mut walked, key);
            let entry = current
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match entry {
                Value::Object(map) => map,
                _ => return Err(DocumentError::NotAGroup(walked)),
            };
        }

        if let Some(Value::Object(_)) = current.get(*last) {
            return Err(DocumentError::NotAField(path.to_string()));
        }
        current.insert(last.to_string(), Value::String(value.into()));
        Ok(())
    }

    /// Remove a field and any groups it leaves empty. Returns the old value.
    pub fn remove(&mut self, path: &str) -> Result<String, DocumentError> {
        let keys = split_path(path)?;

        let mut root = self.root.clone();
        let removed = remove_in(&mut root, &keys, path)?;
        if root.is_empty() {
            return Err(DocumentError::WouldEmpty(path.to_string()));
        }

        self.root = root;
        Ok(removed)
    }
}

fn validate_object(object: &Map<String, Value>, path: &str) -> Result<(), DocumentError> {
    if object.is_empty() {
        let at = if path.is_empty() { "/" } else { path };
        return Err(DocumentError::EmptyObject(at.to_string()));
    }

    for (key, value) in object {
        let mut child = path.to_string();
        push_key(&mut child, key);
        if key.is_empty() || key.contains(PATH_SEPARATOR) {
            return Err(DocumentError::InvalidKey(child));
        }
        match value {
            Value::String(_) => {}
            Value::Object(inner) => validate_object(inner, &child)?,
            _ => return Err(DocumentError::InvalidValue(child)),
        }
    }
    Ok(())
}

fn collect_fields<'a>(
    object: &'a Map<String, Value>,
    path: &str,
    include_hidden: bool,
    fields: &mut BTreeMap<String, &'a str>,
) {
    for (key, value) in object {
        if key.starts_with(HIDDEN_PREFIX) && !include_hidden {
            continue;
        }
        let mut child = path.to_string();
        push_key(&mut child, key);
        match value {
            Value::String(s) => {
                fields.insert(child, s.as_str());
            }
            Value::Object(inner) => collect_fields(inner, &child, include_hidden, fields),
            _ => {}
        }
    }
}

fn remove_in(
    object: &mut Map<String, Value>,
    keys: &[&str],
    path: &str,
) -> Result<String, DocumentError> {
    match keys {
        [] => Err(DocumentError::InvalidPath(path.to_string())),
        [last] => match object.get(*last) {
            Some(Value::String(_)) => match object.remove(*last) {
                Some(Value::String(old)) => Ok(old),
                _ => Err(DocumentError::NotFound(path.to_string())),
            },
            Some(_) => Err(DocumentError::NotAField(path.to_string())),
            None => Err(DocumentError::NotFound(path.to_string())),
        },
        [first, rest @ ..] => {
            let Some(Value::Object(inner)) = object.get_mut(*first) else {
                return Err(DocumentError::NotFound(path.to_string()));
            };
            let removed = remove_in(inner, rest, path)?;
            if inner.is_empty() {
                object.remove(*first);
            }
            Ok(removed)
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, DocumentError> {
    let keys: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    if keys.iter().any(|k| k.is_empty()) {
        return Err(DocumentError::InvalidPath(path.to_string()));
    }
    Ok(keys)
}

fn push_key(path: &mut String, key: &str) {
    if !path.is_empty() {
        path.push(PATH_SEPARATOR);
    }
    path.push_str(key);
}
